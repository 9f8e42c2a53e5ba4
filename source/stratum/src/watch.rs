use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stratum_model::Labels;

use crate::api::{EventSink, LogLevel, WatchEvent};

/// One registered watcher. Streams hold the strong reference; the namespace
/// indices hold weak ones, so dropping the stream unregisters the watcher
/// and the dead-pointer GC pass reclaims stragglers.
pub struct Watcher {
    pub uid: u32,
    pub root_path: PathBuf,
    pub labels: Labels,
    pub document: String,
    pub flavors: Vec<String>,
    pub log_level: LogLevel,
    pub with_position: bool,
    sink: Arc<dyn EventSink<WatchEvent>>,
    last_delivered: Mutex<Option<[u8; 32]>>,
    closed: AtomicBool,
}

impl Watcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uid: u32,
        root_path: PathBuf,
        labels: Labels,
        document: String,
        flavors: Vec<String>,
        log_level: LogLevel,
        with_position: bool,
        sink: Arc<dyn EventSink<WatchEvent>>,
    ) -> Watcher {
        Watcher {
            uid,
            root_path,
            labels,
            document,
            flavors,
            log_level,
            with_position,
            sink,
            last_delivered: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver an event; a fire whose checksum equals the last delivered one
    /// is suppressed and nothing reaches the peer. A closed peer marks the
    /// watcher dead so further work for it is abandoned at the next
    /// boundary.
    pub fn deliver(&self, event: WatchEvent) -> Delivery {
        {
            let mut last = self.last_delivered.lock().unwrap();
            if event.element.is_some() {
                if last.as_ref() == Some(&event.checksum) {
                    tracing::debug!(
                        uid = self.uid,
                        document = %self.document,
                        "suppressing unchanged watcher fire"
                    );
                    return Delivery::Suppressed;
                }
                *last = Some(event.checksum);
            }
        }
        if self.sink.deliver(event) {
            Delivery::Sent
        } else {
            self.closed.store(true, Ordering::Release);
            Delivery::Closed
        }
    }
}

/// What happened to one watcher fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event reached the peer.
    Sent,
    /// Unchanged result, nothing was emitted.
    Suppressed,
    /// The peer is gone.
    Closed,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("uid", &self.uid)
            .field("document", &self.document)
            .field("labels", &self.labels.repr())
            .finish()
    }
}

/// The per-stream uid table. `uid`s are stable within one stream; reusing a
/// live uid is an error, removing an unknown one too.
#[derive(Default)]
pub struct WatchStream {
    by_uid: Mutex<HashMap<u32, Arc<Watcher>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    UidInUse,
}

impl WatchStream {
    pub fn new() -> WatchStream {
        WatchStream::default()
    }

    pub fn insert(&self, watcher: Arc<Watcher>) -> RegisterOutcome {
        let mut by_uid = self.by_uid.lock().unwrap();
        match by_uid.entry(watcher.uid) {
            std::collections::hash_map::Entry::Occupied(_) => RegisterOutcome::UidInUse,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(watcher);
                RegisterOutcome::Added
            }
        }
    }

    pub fn remove(&self, uid: u32) -> Option<Arc<Watcher>> {
        self.by_uid.lock().unwrap().remove(&uid)
    }

    pub fn get(&self, uid: u32) -> Option<Arc<Watcher>> {
        self.by_uid.lock().unwrap().get(&uid).cloned()
    }

    pub fn drain(&self) -> Vec<Arc<Watcher>> {
        self.by_uid.lock().unwrap().drain().map(|(_, w)| w).collect()
    }
}

/// Drop expired entries of a weak set in place, returning how many remain.
pub fn prune_expired<T>(set: &mut Vec<std::sync::Weak<T>>) -> usize {
    set.retain(|w| w.strong_count() > 0);
    set.len()
}
