use std::sync::Arc;

use crate::cache::McStatus;
use crate::namespace::registry::Registry;
use crate::namespace::{ConfigNamespace, NamespaceStatus, NUMBER_OF_MC_GENERATIONS};
use crate::time::monotonic_now_sec;

/// The six collectable segments, addressable through `RunGC` and driven
/// periodically by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    McGen0,
    McGen1,
    McGen2,
    DeadPointers,
    Namespaces,
    Versions,
}

pub fn run(registry: &Registry, kind: GcType, max_live_sec: u64) {
    match kind {
        GcType::McGen0 => gc_merged_configs(registry, 0, max_live_sec),
        GcType::McGen1 => gc_merged_configs(registry, 1, max_live_sec),
        GcType::McGen2 => gc_merged_configs(registry, 2, max_live_sec),
        GcType::DeadPointers => gc_dead_pointers(registry),
        GcType::Namespaces => gc_namespaces(registry, max_live_sec),
        GcType::Versions => gc_versions(registry, max_live_sec),
    }
}

/// Relink pass over one generation: recently used entries move up a
/// generation (the last one keeps its survivors), the rest unlink. Entries
/// mid-build or mid-optimization are left for the next cycle.
fn gc_merged_configs(registry: &Registry, generation: usize, max_live_sec: u64) {
    debug_assert!(generation < NUMBER_OF_MC_GENERATIONS);
    let now = monotonic_now_sec();
    for ns in registry.all() {
        let mut state = ns.state.write().unwrap();
        let drained = std::mem::take(&mut state.mc_generations[generation]);
        let mut kept = 0usize;
        let mut dropped = 0usize;
        for mc in drained {
            if matches!(mc.status(), McStatus::Building | McStatus::Optimizing) {
                state.mc_generations[generation].push(mc);
                continue;
            }
            if mc.last_access() + max_live_sec > now {
                let target = (generation + 1).min(NUMBER_OF_MC_GENERATIONS - 1);
                state.mc_generations[target].push(mc);
                kept += 1;
            } else {
                dropped += 1;
            }
        }
        state.merged_by_key.retain(|_, weak| weak.strong_count() > 0);
        if kept + dropped > 0 {
            tracing::debug!(
                root_path = %ns.root_path.display(),
                generation,
                kept,
                dropped,
                "merged-config gc pass"
            );
        }
    }
}

fn gc_dead_pointers(registry: &Registry) {
    for ns in registry.all() {
        ns.sweep_dead_pointers();
    }
}

/// Drop namespaces that nobody touched within the window and nobody
/// watches. The next `get_or_build` reindexes from disk.
fn gc_namespaces(registry: &Registry, max_live_sec: u64) {
    let now = monotonic_now_sec();
    for ns in registry.all() {
        if ns.status() != NamespaceStatus::Ok {
            continue;
        }
        if ns.last_access() + max_live_sec > now || ns.has_live_watchers() {
            continue;
        }
        ns.mark_deleted();
        registry.remove(&ns);
    }
}

/// Pop expired version history, advance `oldest_version` and rewrite the
/// per-document version maps down to the floor entry that defines the value
/// at the new horizon.
fn gc_versions(registry: &Registry, max_live_sec: u64) {
    let limit = monotonic_now_sec().saturating_sub(max_live_sec);
    for ns in registry.all() {
        gc_namespace_versions(&ns, limit);
    }
}

/// Exposed at the deprecation-horizon granularity so callers (and tests)
/// can pass an explicit limit.
pub(crate) fn gc_namespace_versions(ns: &Arc<ConfigNamespace>, limit: u64) {
    let mut state = ns.state.write().unwrap();
    let mut new_oldest = state.oldest_version;
    while state.stored_versions.len() > 1 {
        let (deprecation_ts, version) = *state.stored_versions.front().unwrap();
        if deprecation_ts != 0 && deprecation_ts <= limit {
            state.stored_versions.pop_front();
            new_oldest = version;
        } else {
            break;
        }
    }
    if new_oldest == state.oldest_version {
        return;
    }
    state.oldest_version = new_oldest;
    tracing::debug!(
        root_path = %ns.root_path.display(),
        oldest_version = new_oldest,
        "version gc pass"
    );

    // Keep everything above the horizon plus the floor entry that defines
    // the value at `oldest_version`.
    for document in state.documents.values() {
        let mut doc_state = document.state.write().unwrap();
        doc_state.overrides.retain(|_, entry| {
            let floor_key = entry
                .by_version
                .range(..=new_oldest)
                .next_back()
                .map(|(k, _)| *k);
            if let Some(floor_key) = floor_key {
                // A tombstone floor defines nothing; drop it with the rest.
                let drop_floor = matches!(entry.by_version.get(&floor_key), Some(None));
                entry
                    .by_version
                    .retain(|k, _| *k > floor_key || (*k == floor_key && !drop_floor));
            }
            !entry.by_version.is_empty()
        });
    }
}
