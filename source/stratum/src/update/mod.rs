pub mod indexer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stratum_model::{Element, Origin};
use tokio::sync::oneshot;

use crate::error::UpdateError;
use crate::namespace::{
    ConfigNamespace, Document, NamespaceStatus, OverrideEntry, RawConfig, VersionId,
    RAW_CONFIG_ID_LIMIT, VERSION_ID_LIMIT,
};
use crate::time::monotonic_now_sec;
use crate::watch::Watcher;

use indexer::{FileIdentity, IndexedFile, RawSeed};

/// What an update did, plus the watcher fanout the caller owes.
pub struct UpdateOutcome {
    pub version: VersionId,
    /// The version actually changed; false when the diff emptied the batch.
    pub changed: bool,
    /// Watchers whose resolution set intersects the touched override paths.
    pub watchers: Vec<Arc<Watcher>>,
    /// The id counters crossed their limits; the namespace must be
    /// soft-deleted from the registry.
    pub overflowed: bool,
}

enum BatchAction {
    Upsert(RawSeed),
    Delete,
}

struct BatchItem {
    identity: FileIdentity,
    action: BatchAction,
}

/// Populate a namespace in `Building` from its root tree. Returns false
/// when indexing fails; the caller publishes the status either way.
pub async fn initial_index(ns: &Arc<ConfigNamespace>) -> bool {
    let indexed = match indexer::index_tree(&ns.pool, &ns.root_path).await {
        Ok(indexed) => indexed,
        Err(err) => {
            tracing::error!(
                root_path = %ns.root_path.display(),
                error = %err,
                "initial index failed"
            );
            return false;
        }
    };

    let mut state = ns.state.write().unwrap();
    let state = &mut *state;
    let version = state.current_version;
    for file in indexed {
        let Some(seed) = file.seed else { continue };
        let document = get_or_create_document(
            &mut state.documents,
            &mut state.next_document_id,
            &file.identity.document,
        );
        let id = state.next_raw_config_id;
        state.next_raw_config_id += 1;
        let raw = make_raw_config(id, document.id, seed);
        for target in &raw.references {
            *state
                .referenced_by
                .entry(target.clone())
                .or_default()
                .entry(file.identity.document.clone())
                .or_default() += 1;
        }
        let mut doc_state = document.state.write().unwrap();
        let entry = doc_state
            .overrides
            .entry(file.identity.override_path.clone())
            .or_insert_with(|| OverrideEntry {
                labels: file.identity.labels.clone(),
                flavor: file.identity.flavor.clone(),
                rel_path: file.identity.override_path.clone(),
                ..OverrideEntry::default()
            });
        entry.by_version.insert(version, Some(raw));
    }
    tracing::info!(
        root_path = %ns.root_path.display(),
        documents = state.documents.len(),
        "namespace indexed"
    );
    true
}

/// The update protocol: serialize behind any in-flight update, index, diff,
/// promote the version, compute the watcher trigger set. The caller runs
/// the per-watcher resolves and handles `overflowed`.
pub async fn apply_update(
    ns: &Arc<ConfigNamespace>,
    reload: bool,
    rel_paths: &[String],
) -> Result<UpdateOutcome, UpdateError> {
    enter_update(ns).await?;
    let result = run_update(ns, reload, rel_paths).await;
    match &result {
        Ok(_) => exit_update(ns),
        Err(err) => {
            tracing::error!(
                root_path = %ns.root_path.display(),
                error = %err,
                "update failed, deleting the namespace"
            );
            ns.mark_deleted();
        }
    }
    result
}

async fn enter_update(ns: &Arc<ConfigNamespace>) -> Result<(), UpdateError> {
    let parked = {
        let mut state = ns.state.write().unwrap();
        match state.status {
            NamespaceStatus::Ok => {
                state.status = NamespaceStatus::OkUpdating;
                None
            }
            NamespaceStatus::OkUpdating => {
                let (tx, rx) = oneshot::channel();
                state.update_queue.push_back(tx);
                Some(rx)
            }
            NamespaceStatus::Building | NamespaceStatus::Deleted => {
                return Err(UpdateError::NamespaceDeleted)
            }
        }
    };
    if let Some(rx) = parked {
        // The finishing update hands the turn over with the status still
        // `OkUpdating`; a dropped sender means the namespace died.
        rx.await.map_err(|_| UpdateError::NamespaceDeleted)?;
    }
    Ok(())
}

fn exit_update(ns: &Arc<ConfigNamespace>) {
    let (next, watch_waiters) = {
        let mut state = ns.state.write().unwrap();
        if let Some(next) = state.update_queue.pop_front() {
            (Some(next), Vec::new())
        } else {
            state.status = NamespaceStatus::Ok;
            (None, std::mem::take(&mut state.watch_wait_queue))
        }
    };
    if let Some(next) = next {
        let _ = next.send(());
    }
    for waiter in watch_waiters {
        let _ = waiter.send(());
    }
}

async fn run_update(
    ns: &Arc<ConfigNamespace>,
    reload: bool,
    rel_paths: &[String],
) -> Result<UpdateOutcome, UpdateError> {
    let indexed = if reload {
        indexer::index_tree(&ns.pool, &ns.root_path).await?
    } else {
        indexer::index_paths(&ns.pool, &ns.root_path, rel_paths).await?
    };

    let batch = diff_batch(ns, reload, indexed);
    if batch.is_empty() {
        let state = ns.state.read().unwrap();
        tracing::debug!(
            root_path = %ns.root_path.display(),
            "update produced an empty batch, keeping version {}",
            state.current_version
        );
        return Ok(UpdateOutcome {
            version: state.current_version,
            changed: false,
            watchers: Vec::new(),
            overflowed: false,
        });
    }

    Ok(commit(ns, batch))
}

/// Step 3 of the protocol: drop unchanged entries, add reload-mode
/// deletions.
fn diff_batch(ns: &Arc<ConfigNamespace>, reload: bool, indexed: Vec<IndexedFile>) -> Vec<BatchItem> {
    let state = ns.state.read().unwrap();
    let mut batch = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for file in indexed {
        seen.insert(file.identity.override_path.clone());
        let current = state
            .documents
            .get(&file.identity.document)
            .and_then(|doc| {
                let doc_state = doc.state.read().unwrap();
                doc_state
                    .overrides
                    .get(&file.identity.override_path)
                    .and_then(|entry| entry.last_raw_config())
            });
        let alive = current.as_ref().is_some_and(|rc| rc.has_content);
        match file.seed {
            Some(seed) => {
                if alive && current.as_ref().unwrap().checksum == seed.checksum {
                    continue;
                }
                batch.push(BatchItem {
                    identity: file.identity,
                    action: BatchAction::Upsert(seed),
                });
            }
            None => {
                if alive {
                    batch.push(BatchItem {
                        identity: file.identity,
                        action: BatchAction::Delete,
                    });
                }
            }
        }
    }

    if reload {
        for doc in state.documents.values() {
            let doc_state = doc.state.read().unwrap();
            for entry in doc_state.overrides.values() {
                if entry.has_last_version() && !seen.contains(&entry.rel_path) {
                    batch.push(BatchItem {
                        identity: FileIdentity {
                            override_path: entry.rel_path.clone(),
                            labels: entry.labels.clone(),
                            document: doc.name.clone(),
                            flavor: entry.flavor.clone(),
                        },
                        action: BatchAction::Delete,
                    });
                }
            }
        }
    }

    batch
}

/// Steps 4-7: replay references, promote the version, invalidate the
/// dependants, collect the watchers to trigger.
fn commit(ns: &Arc<ConfigNamespace>, batch: Vec<BatchItem>) -> UpdateOutcome {
    let mut state = ns.state.write().unwrap();
    let state = &mut *state;

    if let Some(tail) = state.stored_versions.back_mut() {
        tail.0 = monotonic_now_sec();
    }
    state.current_version += 1;
    let version = state.current_version;
    state.stored_versions.push_back((0, version));

    let mut fired: HashMap<usize, Arc<Watcher>> = HashMap::new();
    let mut touched: HashSet<String> = HashSet::new();

    for item in batch {
        let document = get_or_create_document(
            &mut state.documents,
            &mut state.next_document_id,
            &item.identity.document,
        );
        touched.insert(item.identity.document.clone());

        let mut doc_state = document.state.write().unwrap();
        let doc_watchers = doc_state.watchers.clone();
        let entry = doc_state
            .overrides
            .entry(item.identity.override_path.clone())
            .or_insert_with(|| OverrideEntry {
                labels: item.identity.labels.clone(),
                flavor: item.identity.flavor.clone(),
                rel_path: item.identity.override_path.clone(),
                watchers: doc_watchers
                    .iter()
                    .filter(|w| {
                        w.upgrade()
                            .map(|w| watcher_matches(&item.identity, &w))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect(),
                ..OverrideEntry::default()
            });

        let old = entry.raw_config_at(version - 1);
        match item.action {
            BatchAction::Upsert(seed) => {
                let id = state.next_raw_config_id;
                state.next_raw_config_id += 1;
                let raw = make_raw_config(id, document.id, seed);
                replay_references(
                    &mut state.referenced_by,
                    &item.identity.document,
                    old.as_deref(),
                    Some(&raw),
                );
                entry.by_version.insert(version, Some(raw));
                tracing::debug!(
                    override_path = %item.identity.override_path,
                    id,
                    version,
                    "stored raw config"
                );
            }
            BatchAction::Delete => {
                replay_references(
                    &mut state.referenced_by,
                    &item.identity.document,
                    old.as_deref(),
                    None,
                );
                entry.by_version.insert(version, None);
                tracing::debug!(
                    override_path = %item.identity.override_path,
                    version,
                    "stored deletion tombstone"
                );
            }
        }

        collect_watchers(entry, &doc_watchers, &item.identity, &mut fired);
    }

    // Affected-document closure: everything that transitively references a
    // touched document re-resolves at the new version. A fresh raw-config id
    // per entry changes the cache keys, so stale merged configs miss while
    // the content is carried forward.
    let mut affected: Vec<String> = touched.iter().cloned().collect();
    let mut visited = touched.clone();
    while let Some(doc_name) = affected.pop() {
        let Some(sources) = state.referenced_by.get(&doc_name) else {
            continue;
        };
        for source in sources.keys() {
            if visited.insert(source.clone()) {
                affected.push(source.clone());
            }
        }
    }

    for doc_name in visited.iter().filter(|d| !touched.contains(*d)) {
        let Some(document) = state.documents.get(doc_name).cloned() else {
            continue;
        };
        let mut doc_state = document.state.write().unwrap();
        let doc_watchers = doc_state.watchers.clone();
        for entry in doc_state.overrides.values_mut() {
            let Some(last) = entry.last_raw_config().filter(|rc| rc.has_content) else {
                continue;
            };
            let id = state.next_raw_config_id;
            state.next_raw_config_id += 1;
            let clone = Arc::new(RawConfig {
                id,
                checksum: last.checksum,
                has_content: true,
                value: stamp_origin(&last.value, document.id, id),
                references: last.references.clone(),
                template: last.template.clone(),
            });
            entry.by_version.insert(version, Some(clone));
            let identity = FileIdentity {
                override_path: entry.rel_path.clone(),
                labels: entry.labels.clone(),
                document: doc_name.clone(),
                flavor: entry.flavor.clone(),
            };
            collect_watchers(entry, &doc_watchers, &identity, &mut fired);
        }
    }

    let overflowed =
        state.next_raw_config_id >= RAW_CONFIG_ID_LIMIT || state.current_version >= VERSION_ID_LIMIT;

    UpdateOutcome {
        version,
        changed: true,
        watchers: fired.into_values().collect(),
        overflowed,
    }
}

pub(crate) fn get_or_create_document(
    documents: &mut HashMap<String, Arc<Document>>,
    next_document_id: &mut u16,
    name: &str,
) -> Arc<Document> {
    if let Some(doc) = documents.get(name) {
        return Arc::clone(doc);
    }
    let doc = Document::new(*next_document_id, name.to_string());
    *next_document_id += 1;
    documents.insert(name.to_string(), Arc::clone(&doc));
    doc
}

fn make_raw_config(id: u32, document_id: u16, seed: RawSeed) -> Arc<RawConfig> {
    Arc::new(RawConfig {
        id,
        checksum: seed.checksum,
        has_content: true,
        value: stamp_origin(&seed.value, document_id, id),
        references: seed.references,
        template: seed.template,
    })
}

fn replay_references(
    referenced_by: &mut HashMap<String, HashMap<String, u32>>,
    source: &str,
    old: Option<&RawConfig>,
    new: Option<&RawConfig>,
) {
    if let Some(old) = old {
        for target in &old.references {
            if let Some(sources) = referenced_by.get_mut(target) {
                if let Some(count) = sources.get_mut(source) {
                    *count -= 1;
                    if *count == 0 {
                        sources.remove(source);
                    }
                }
                if sources.is_empty() {
                    referenced_by.remove(target);
                }
            }
        }
    }
    if let Some(new) = new {
        for target in &new.references {
            *referenced_by
                .entry(target.clone())
                .or_default()
                .entry(source.to_string())
                .or_default() += 1;
        }
    }
}

fn collect_watchers(
    entry: &OverrideEntry,
    doc_watchers: &[std::sync::Weak<Watcher>],
    identity: &FileIdentity,
    fired: &mut HashMap<usize, Arc<Watcher>>,
) {
    for weak in entry.watchers.iter().chain(doc_watchers.iter()) {
        if let Some(watcher) = weak.upgrade() {
            if !watcher.is_closed() && watcher_matches(identity, &watcher) {
                fired.insert(Arc::as_ptr(&watcher) as usize, watcher);
            }
        }
    }
}

/// A touched override path triggers a watcher when it could contribute to
/// the watcher's resolution set.
fn watcher_matches(identity: &FileIdentity, watcher: &Watcher) -> bool {
    watcher.document == identity.document
        && watcher.labels.contains(&identity.labels)
        && match &identity.flavor {
            None => true,
            Some(flavor) => watcher.flavors.iter().any(|f| f == flavor),
        }
}

/// Rewrite a parsed tree with the ids it was committed under; the positions
/// in wire payloads resolve through these.
fn stamp_origin(element: &Element, document_id: u16, raw_config_id: u32) -> Element {
    let origin = Origin::new(document_id, raw_config_id);
    let mut out = element.clone().with_origin(origin);
    if out.is_map() {
        let entries: Vec<_> = out
            .as_map()
            .expect("kind checked")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let map = out.as_map_mut().expect("kind checked");
        for (key, value) in entries {
            map.insert(key, stamp_origin(&value, document_id, raw_config_id));
        }
    } else if out.is_sequence() {
        let items = out.as_sequence().expect("kind checked").to_vec();
        let seq = out.as_sequence_mut().expect("kind checked");
        seq.clear();
        for item in items {
            seq.push(stamp_origin(&item, document_id, raw_config_id));
        }
    }
    out
}
