pub mod registry;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use itertools::Itertools;
use stratum_model::{Element, Labels, StringPool};
use tokio::sync::oneshot;

use crate::cache::{CacheKey, MergedConfig};
use crate::time::monotonic_now_sec;
use crate::trace::{TraceEvent, TraceSubscription};
use crate::watch::{prune_expired, Watcher};

pub type VersionId = u32;

pub const NUMBER_OF_MC_GENERATIONS: usize = 3;

/// Soft-delete thresholds: a namespace whose id counters reach these values
/// is removed from the registry so the next request rebuilds it from disk
/// with fresh counters.
pub const RAW_CONFIG_ID_LIMIT: u32 = 0xff00_0000;
pub const VERSION_ID_LIMIT: VersionId = 0xffff_fff0;

/// One parsed source file at one version.
#[derive(Debug, Clone)]
pub struct RawConfig {
    /// Unique within the namespace, never reused.
    pub id: u32,
    /// crc32 of the file bytes, used by the update diff.
    pub checksum: u32,
    /// False for the synthetic configs inserted to invalidate dependants.
    pub has_content: bool,
    pub value: Element,
    /// Documents named by `!ref` paths inside `value`.
    pub references: Vec<String>,
    /// Source text for `_tmpl.` documents.
    pub template: Option<String>,
}

/// One `(labels, document, flavor)` source slot and its version history.
/// `None` values are tombstones for deleted files.
#[derive(Debug, Default)]
pub struct OverrideEntry {
    pub labels: Labels,
    pub flavor: Option<String>,
    /// Path relative to the namespace root, e.g. `env/prod/db.cache.yaml`.
    pub rel_path: String,
    pub by_version: BTreeMap<VersionId, Option<Arc<RawConfig>>>,
    pub watchers: Vec<Weak<Watcher>>,
}

impl OverrideEntry {
    /// The raw config visible at `version`: the greatest entry at or below
    /// it, unless that entry is a tombstone or has no content.
    pub fn raw_config_at(&self, version: VersionId) -> Option<Arc<RawConfig>> {
        let (_, slot) = self.by_version.range(..=version).next_back()?;
        slot.as_ref().filter(|rc| rc.has_content).cloned()
    }

    /// Whether the newest stored version carries content.
    pub fn has_last_version(&self) -> bool {
        self.by_version
            .values()
            .next_back()
            .and_then(|slot| slot.as_ref())
            .map(|rc| rc.has_content)
            .unwrap_or(false)
    }

    /// The newest raw config regardless of content, for diffing.
    pub fn last_raw_config(&self) -> Option<Arc<RawConfig>> {
        self.by_version.values().next_back()?.clone()
    }
}

#[derive(Debug)]
pub struct DocumentState {
    /// Keyed by override path (`rel_path`).
    pub overrides: HashMap<String, OverrideEntry>,
    pub watchers: Vec<Weak<Watcher>>,
}

/// A named document within one namespace. Readers hold the read lock;
/// updates and GC rewrites hold the write lock.
#[derive(Debug)]
pub struct Document {
    pub id: u16,
    pub name: String,
    pub state: RwLock<DocumentState>,
}

impl Document {
    pub fn new(id: u16, name: String) -> Arc<Document> {
        Arc::new(Document {
            id,
            name,
            state: RwLock::new(DocumentState {
                overrides: HashMap::new(),
                watchers: Vec::new(),
            }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStatus {
    Building,
    Ok,
    OkUpdating,
    Deleted,
}

pub struct NamespaceState {
    pub status: NamespaceStatus,
    pub current_version: VersionId,
    /// Versions at or below this are unresolvable.
    pub oldest_version: VersionId,
    pub next_raw_config_id: u32,
    pub next_document_id: u16,
    pub documents: HashMap<String, Arc<Document>>,
    /// `referenced_by[target][source]` counts how many raw configs of
    /// `source` reference `target`. An index, not an ownership relation.
    pub referenced_by: HashMap<String, HashMap<String, u32>>,
    /// `(deprecation_ts, version)`; the tail is the live version with a
    /// zero timestamp.
    pub stored_versions: VecDeque<(u64, VersionId)>,
    /// Callers parked until the initial index finishes.
    pub build_waiters: Vec<oneshot::Sender<()>>,
    /// Updates serialized behind the one in flight.
    pub update_queue: VecDeque<oneshot::Sender<()>>,
    /// Watch registrations parked while an update is in flight.
    pub watch_wait_queue: Vec<oneshot::Sender<()>>,
    pub merged_by_key: HashMap<CacheKey, Weak<MergedConfig>>,
    pub mc_generations: [Vec<Arc<MergedConfig>>; NUMBER_OF_MC_GENERATIONS],
    pub traces: Vec<Weak<TraceSubscription>>,
}

/// All state for one root path.
pub struct ConfigNamespace {
    pub id: u64,
    pub root_path: PathBuf,
    pub pool: StringPool,
    last_access: AtomicU64,
    pub state: RwLock<NamespaceState>,
}

impl ConfigNamespace {
    pub fn new(id: u64, root_path: PathBuf) -> Arc<ConfigNamespace> {
        Arc::new(ConfigNamespace {
            id,
            root_path,
            pool: StringPool::new(),
            last_access: AtomicU64::new(monotonic_now_sec()),
            state: RwLock::new(NamespaceState {
                status: NamespaceStatus::Building,
                current_version: 1,
                oldest_version: 0,
                next_raw_config_id: 1,
                next_document_id: 0,
                documents: HashMap::new(),
                referenced_by: HashMap::new(),
                stored_versions: VecDeque::from([(0, 1)]),
                build_waiters: Vec::new(),
                update_queue: VecDeque::new(),
                watch_wait_queue: Vec::new(),
                merged_by_key: HashMap::new(),
                mc_generations: Default::default(),
                traces: Vec::new(),
            }),
        })
    }

    pub fn touch(&self) {
        self.last_access
            .store(monotonic_now_sec(), Ordering::Relaxed);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> NamespaceStatus {
        self.state.read().unwrap().status
    }

    /// Resolve a requested version: 0 means current, anything at or below
    /// `oldest_version` or above `current_version` is unresolvable.
    pub fn resolve_version(&self, requested: VersionId) -> Option<VersionId> {
        let state = self.state.read().unwrap();
        if requested == 0 {
            return Some(state.current_version);
        }
        if requested <= state.oldest_version || requested > state.current_version {
            return None;
        }
        Some(requested)
    }

    /// A read view pinned to one version; `None` when the version is gone.
    pub fn snapshot(self: &Arc<Self>, requested: VersionId) -> Option<VersionView> {
        let version = self.resolve_version(requested)?;
        Some(VersionView {
            namespace: Arc::clone(self),
            version,
        })
    }

    /// Probe the merged-config cache, inserting a fresh `Building` entry on
    /// miss. Returns the entry and whether this caller inserted it (and so
    /// owns the build).
    pub fn merged_config_entry(
        &self,
        key: &CacheKey,
        document: &str,
    ) -> (Arc<MergedConfig>, bool) {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = state.merged_by_key.get(key).and_then(Weak::upgrade) {
            return (existing, false);
        }
        let entry = Arc::new(MergedConfig::new(key.clone(), document.to_string()));
        state
            .merged_by_key
            .insert(key.clone(), Arc::downgrade(&entry));
        state.mc_generations[0].push(Arc::clone(&entry));
        (entry, true)
    }

    /// Unlink a failed build so the next request retries.
    pub fn forget_merged_config(&self, key: &CacheKey) {
        let mut state = self.state.write().unwrap();
        state.merged_by_key.remove(key);
        for generation in state.mc_generations.iter_mut() {
            generation.retain(|mc| &mc.key != key);
        }
    }

    /// Fan a trace event out to the live subscriptions that want it.
    pub fn emit_trace(&self, event: &TraceEvent) {
        let subs: Vec<Arc<TraceSubscription>> = {
            let state = self.state.read().unwrap();
            state.traces.iter().filter_map(Weak::upgrade).collect()
        };
        for sub in subs {
            sub.offer(event);
        }
    }

    pub fn subscribe_trace(&self, subscription: &Arc<TraceSubscription>) {
        let mut state = self.state.write().unwrap();
        state.traces.push(Arc::downgrade(subscription));
    }

    /// Every live watcher currently attached to any document of the
    /// namespace.
    pub fn live_watchers(&self) -> Vec<Arc<Watcher>> {
        let documents: Vec<Arc<Document>> = {
            let state = self.state.read().unwrap();
            state.documents.values().cloned().collect()
        };
        let mut out = Vec::new();
        for document in documents {
            let doc_state = document.state.read().unwrap();
            out.extend(doc_state.watchers.iter().filter_map(Weak::upgrade));
        }
        out
    }

    pub fn has_live_watchers(&self) -> bool {
        !self.live_watchers().is_empty()
    }

    /// Drop expired weak pointers from every watcher and trace set.
    pub fn sweep_dead_pointers(&self) {
        let documents: Vec<Arc<Document>> = {
            let mut state = self.state.write().unwrap();
            state.traces.retain(|t| t.strong_count() > 0);
            state.documents.values().cloned().collect()
        };
        for document in documents {
            let mut doc_state = document.state.write().unwrap();
            prune_expired(&mut doc_state.watchers);
            for entry in doc_state.overrides.values_mut() {
                prune_expired(&mut entry.watchers);
            }
        }
    }

    /// Terminal transition: wake everything that was parked and let it
    /// observe the deletion.
    pub fn mark_deleted(&self) {
        let (build_waiters, update_queue, watch_waiters) = {
            let mut state = self.state.write().unwrap();
            state.status = NamespaceStatus::Deleted;
            (
                std::mem::take(&mut state.build_waiters),
                std::mem::take(&mut state.update_queue),
                std::mem::take(&mut state.watch_wait_queue),
            )
        };
        // Dropping the senders wakes the receivers with a closed-channel
        // error; they re-read the status and fail their requests.
        drop(build_waiters);
        drop(update_queue);
        drop(watch_waiters);
        tracing::info!(root_path = %self.root_path.display(), id = self.id, "namespace deleted");
    }
}

/// A namespace pinned to one resolvable version. Updates promoted after
/// the snapshot was taken stay invisible through it.
pub struct VersionView {
    pub namespace: Arc<ConfigNamespace>,
    pub version: VersionId,
}

/// How one override entry contributes to a request, before version
/// selection.
#[derive(Debug, Clone)]
pub struct Contributor {
    pub rel_path: String,
    pub raw_config: Arc<RawConfig>,
}

/// Select and order the override entries of `document` that apply to
/// `(labels, flavors)` at `version`.
///
/// An entry contributes iff its labels are a subset of the request labels
/// and its flavor is absent or requested. The precedence is a stable sort by
/// `(flavor index, label count, path)`: flavorless entries first, then the
/// requested flavors in request order, less specific directories before
/// deeper ones, later entries taking precedence in the fold.
pub fn contributors_at(
    document: &Document,
    labels: &Labels,
    flavors: &[String],
    version: VersionId,
) -> Vec<Contributor> {
    let state = document.state.read().unwrap();
    state
        .overrides
        .values()
        .filter(|entry| labels.contains(&entry.labels))
        .filter_map(|entry| {
            let flavor_index = match &entry.flavor {
                None => 0,
                Some(flavor) => flavors.iter().position(|f| f == flavor)? + 1,
            };
            Some((flavor_index, entry.labels.len(), &entry.rel_path, entry))
        })
        .sorted_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)))
        .filter_map(|(_, _, _, entry)| {
            entry.raw_config_at(version).map(|raw_config| Contributor {
                rel_path: entry.rel_path.clone(),
                raw_config,
            })
        })
        .collect()
}
