pub mod dag;
pub mod merger;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use stratum_model::{Element, Labels};

use crate::api::{wire, RequestLog, SourceInfo};
use crate::cache::{BuildOutcome, MergedConfig, Probe};
use crate::error::ResolveError;
use crate::namespace::{ConfigNamespace, NamespaceStatus, VersionId};

use merger::ElementMerger;

/// A fully resolved request, before the API layer shapes the response.
pub struct Resolved {
    pub version: VersionId,
    pub element: Element,
    pub checksum: [u8; 32],
    /// Optimized wire payload, when the cache entry already carries one.
    pub payload: Option<Bytes>,
    /// Every contributing source file across the reference closure.
    pub sources: Vec<SourceInfo>,
    pub source_lookup: HashMap<(u16, u32), SourceInfo>,
}

/// Resolve `document` at a concrete `version`. Documents are built in
/// reference order with at most one concurrent build per cache key; parked
/// requests resume with the builder's result.
pub async fn resolve_document(
    ns: &Arc<ConfigNamespace>,
    document: &str,
    labels: &Labels,
    flavors: &[String],
    version: VersionId,
    log: &RequestLog,
) -> Result<Resolved, ResolveError> {
    ns.touch();
    let plan = {
        let state = ns.state.read().unwrap();
        if state.status == NamespaceStatus::Deleted {
            return Err(ResolveError::NamespaceDeleted);
        }
        dag::build_plan(&state, document, labels, flavors, version)?
    };

    let mut sources = Vec::new();
    let mut source_lookup = HashMap::new();
    for item in &plan {
        for contributor in &item.contributors {
            let info = SourceInfo {
                document_id: item.document.id,
                raw_config_id: contributor.raw_config.id,
                checksum: contributor.raw_config.checksum,
                path: contributor.rel_path.clone(),
            };
            source_lookup.insert((info.document_id, info.raw_config_id), info.clone());
            sources.push(info);
        }
    }

    let mut elements: HashMap<String, Element> = HashMap::new();
    let mut last: Option<BuildOutcome> = None;
    for item in &plan {
        let (entry, owns) = ns.merged_config_entry(&item.key, &item.document.name);
        let outcome = if owns {
            build_entry(ns, &entry, item, &elements, log)?
        } else {
            match entry.probe() {
                Probe::Ready(outcome) => outcome,
                Probe::Wait(rx) => match rx.await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => return Err(err),
                    Err(_) => {
                        return Err(ResolveError::Build {
                            reason: "the build was abandoned".to_string(),
                        })
                    }
                },
            }
        };
        elements.insert(item.document.name.clone(), outcome.element.clone());
        last = Some(outcome);
    }

    let outcome = last.expect("the plan always contains the requested document");
    Ok(Resolved {
        version,
        element: outcome.element,
        checksum: outcome.checksum,
        payload: outcome.payload,
        sources,
        source_lookup,
    })
}

fn build_entry(
    ns: &Arc<ConfigNamespace>,
    entry: &Arc<MergedConfig>,
    item: &dag::PlanItem,
    elements: &HashMap<String, Element>,
    log: &RequestLog,
) -> Result<BuildOutcome, ResolveError> {
    tracing::debug!(
        document = %item.document.name,
        key = ?item.key,
        "building merged config"
    );
    let merger = ElementMerger::new(&ns.pool, elements, log);
    let merged = merger.merge(
        item.contributors
            .iter()
            .map(|c| c.raw_config.value.clone()),
    );
    match merged {
        Ok(element) => {
            let checksum = element.checksum();
            let outcome = entry.complete_build(element, checksum);
            spawn_optimize(Arc::clone(entry));
            Ok(outcome)
        }
        Err(err) => {
            entry.fail_build(err.clone());
            ns.forget_merged_config(&item.key);
            Err(err)
        }
    }
}

/// Serialize the element stream in the background so later readers get the
/// preprocessed payload. The optimized form never carries positions; a
/// request with `with_position` encodes fresh from the element.
fn spawn_optimize(entry: Arc<MergedConfig>) {
    tokio::spawn(async move {
        if let Some(value) = entry.begin_optimize() {
            let encoded = wire::encode(&value, false, &HashMap::new());
            entry.finish_optimize(Some(encoded.payload));
        }
    });
}
