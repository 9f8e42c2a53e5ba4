use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bytes::Bytes;
use stratum_model::Element;
use tokio::sync::oneshot;

use crate::error::ResolveError;
use crate::time::monotonic_now_sec;

/// The ordered `RawConfig` ids contributing to one resolved document. Ids
/// are unique and monotonic within a namespace, so the key pins the exact
/// set of underlying files.
pub type CacheKey = Vec<u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McStatus {
    Building,
    NoOptimized,
    Optimizing,
    Optimized,
    OptimizationFail,
}

/// What a parked request receives when the build (or the optimization pass)
/// it waited on finishes.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub element: Element,
    pub checksum: [u8; 32],
    pub payload: Option<Bytes>,
}

pub type BuildResult = Result<BuildOutcome, ResolveError>;

pub struct McState {
    pub status: McStatus,
    pub value: Element,
    pub checksum: [u8; 32],
    pub payload: Option<Bytes>,
    pub waiting: Vec<oneshot::Sender<BuildResult>>,
}

/// A fully resolved answer for one cache key, shared through the namespace
/// cache and linked into exactly one GC generation at a time.
pub struct MergedConfig {
    pub key: CacheKey,
    pub document: String,
    pub creation_ts: u64,
    last_access: AtomicU64,
    state: RwLock<McState>,
}

/// What a cache probe tells the caller to do next.
pub enum Probe {
    /// The value is ready.
    Ready(BuildOutcome),
    /// Someone else is building or optimizing; await the receiver.
    Wait(oneshot::Receiver<BuildResult>),
}

impl MergedConfig {
    pub fn new(key: CacheKey, document: String) -> MergedConfig {
        MergedConfig {
            key,
            document,
            creation_ts: monotonic_now_sec(),
            last_access: AtomicU64::new(monotonic_now_sec()),
            state: RwLock::new(McState {
                status: McStatus::Building,
                value: Element::undefined(),
                checksum: [0; 32],
                payload: None,
                waiting: Vec::new(),
            }),
        }
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_access.store(monotonic_now_sec(), Ordering::Relaxed);
    }

    pub fn status(&self) -> McStatus {
        self.state.read().unwrap().status
    }

    /// Probe an entry someone already inserted. A `Building` or `Optimizing`
    /// entry parks the caller instead of starting a second build.
    pub fn probe(&self) -> Probe {
        self.touch();
        let mut state = self.state.write().unwrap();
        match state.status {
            McStatus::Building | McStatus::Optimizing => {
                let (tx, rx) = oneshot::channel();
                state.waiting.push(tx);
                Probe::Wait(rx)
            }
            McStatus::NoOptimized | McStatus::Optimized | McStatus::OptimizationFail => {
                Probe::Ready(BuildOutcome {
                    element: state.value.clone(),
                    checksum: state.checksum,
                    payload: state.payload.clone(),
                })
            }
        }
    }

    /// The builder finished; store the value and wake everyone parked on the
    /// build. Waiters are drained after the lock is released.
    pub fn complete_build(&self, element: Element, checksum: [u8; 32]) -> BuildOutcome {
        let waiting;
        let outcome = BuildOutcome {
            element: element.clone(),
            checksum,
            payload: None,
        };
        {
            let mut state = self.state.write().unwrap();
            state.status = McStatus::NoOptimized;
            state.value = element;
            state.checksum = checksum;
            waiting = std::mem::take(&mut state.waiting);
        }
        for waiter in waiting {
            let _ = waiter.send(Ok(outcome.clone()));
        }
        outcome
    }

    /// The build failed; every waiter gets the error. The caller unlinks the
    /// entry from the cache under the namespace lock so the next request
    /// retries; the status stays `Building`, so a straggler holding the dead
    /// entry parks and is released by the drop of the waiting list.
    pub fn fail_build(&self, error: ResolveError) {
        let waiting;
        {
            let mut state = self.state.write().unwrap();
            waiting = std::mem::take(&mut state.waiting);
        }
        for waiter in waiting {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Move `NoOptimized` to `Optimizing`. Only one optimization task may
    /// run; a false return means another task already claimed it.
    pub fn begin_optimize(&self) -> Option<Element> {
        let mut state = self.state.write().unwrap();
        if state.status != McStatus::NoOptimized {
            return None;
        }
        state.status = McStatus::Optimizing;
        Some(state.value.clone())
    }

    pub fn finish_optimize(&self, payload: Option<Bytes>) {
        let waiting;
        let outcome;
        {
            let mut state = self.state.write().unwrap();
            state.status = match payload {
                Some(_) => McStatus::Optimized,
                None => McStatus::OptimizationFail,
            };
            state.payload = payload;
            waiting = std::mem::take(&mut state.waiting);
            outcome = BuildOutcome {
                element: state.value.clone(),
                checksum: state.checksum,
                payload: state.payload.clone(),
            };
        }
        for waiter in waiting {
            let _ = waiter.send(Ok(outcome.clone()));
        }
    }
}
