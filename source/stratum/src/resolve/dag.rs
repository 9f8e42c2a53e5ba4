use std::collections::HashSet;
use std::sync::Arc;

use stratum_model::Labels;

use crate::cache::CacheKey;
use crate::error::ResolveError;
use crate::namespace::{contributors_at, Contributor, Document, NamespaceState, VersionId};

/// One document of the build plan, dependencies first, the requested
/// document last.
#[derive(Debug)]
pub struct PlanItem {
    pub document: Arc<Document>,
    pub contributors: Vec<Contributor>,
    pub key: CacheKey,
}

/// Walk the reference graph from `document`, rejecting cycles and producing
/// the build order: a depth-first postorder, so every document appears after
/// everything it references.
pub fn build_plan(
    state: &NamespaceState,
    document: &str,
    labels: &Labels,
    flavors: &[String],
    version: VersionId,
) -> Result<Vec<PlanItem>, ResolveError> {
    let mut plan = Vec::new();
    let mut dfs_path = Vec::new();
    let mut dfs_path_set = HashSet::new();
    let mut visited = HashSet::new();
    visit(
        state,
        document,
        labels,
        flavors,
        version,
        &mut dfs_path,
        &mut dfs_path_set,
        &mut visited,
        &mut plan,
    )?;
    Ok(plan)
}

#[allow(clippy::too_many_arguments)]
fn visit(
    state: &NamespaceState,
    document: &str,
    labels: &Labels,
    flavors: &[String],
    version: VersionId,
    dfs_path: &mut Vec<String>,
    dfs_path_set: &mut HashSet<String>,
    visited: &mut HashSet<String>,
    plan: &mut Vec<PlanItem>,
) -> Result<(), ResolveError> {
    if dfs_path_set.contains(document) {
        let cycle = dfs_path.join("', '");
        return Err(ResolveError::RefGraphIsNotDag {
            document: document.to_string(),
            path: format!("'{cycle}'"),
        });
    }
    if visited.contains(document) {
        return Ok(());
    }

    let Some(doc) = state.documents.get(document) else {
        return Err(ResolveError::MissingDocument {
            document: document.to_string(),
        });
    };
    let contributors = contributors_at(doc, labels, flavors, version);
    if contributors.is_empty() {
        return Err(ResolveError::MissingDocument {
            document: document.to_string(),
        });
    }

    dfs_path.push(document.to_string());
    dfs_path_set.insert(document.to_string());

    let references: Vec<String> = contributors
        .iter()
        .flat_map(|c| c.raw_config.references.iter().cloned())
        .collect();
    for reference in references {
        visit(
            state,
            &reference,
            labels,
            flavors,
            version,
            dfs_path,
            dfs_path_set,
            visited,
            plan,
        )?;
    }

    dfs_path.pop();
    dfs_path_set.remove(document);
    visited.insert(document.to_string());

    let key: CacheKey = contributors.iter().map(|c| c.raw_config.id).collect();
    plan.push(PlanItem {
        document: Arc::clone(doc),
        contributors,
        key,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{ConfigNamespace, OverrideEntry, RawConfig};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use stratum_model::Element;

    fn raw(id: u32, references: &[&str]) -> Arc<RawConfig> {
        Arc::new(RawConfig {
            id,
            checksum: id,
            has_content: true,
            value: Element::int(id as i64),
            references: references.iter().map(|s| s.to_string()).collect(),
            template: None,
        })
    }

    fn install(ns: &ConfigNamespace, name: &str, id: u16, raw_config: Arc<RawConfig>) {
        let doc = Document::new(id, name.to_string());
        {
            let mut doc_state = doc.state.write().unwrap();
            doc_state.overrides.insert(
                format!("{name}.yaml"),
                OverrideEntry {
                    labels: Labels::empty(),
                    flavor: None,
                    rel_path: format!("{name}.yaml"),
                    by_version: BTreeMap::from([(1, Some(raw_config))]),
                    watchers: Vec::new(),
                },
            );
        }
        ns.state
            .write()
            .unwrap()
            .documents
            .insert(name.to_string(), doc);
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let ns = ConfigNamespace::new(1, PathBuf::from("/cfg"));
        install(&ns, "a", 0, raw(1, &["b"]));
        install(&ns, "b", 1, raw(2, &["c"]));
        install(&ns, "c", 2, raw(3, &[]));

        let state = ns.state.read().unwrap();
        let plan = build_plan(&state, "a", &Labels::empty(), &[], 1).unwrap();
        let order: Vec<&str> = plan.iter().map(|p| p.document.name.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert_eq!(plan[2].key, vec![1]);
    }

    #[test]
    fn diamond_references_resolve_once() {
        let ns = ConfigNamespace::new(1, PathBuf::from("/cfg"));
        install(&ns, "a", 0, raw(1, &["b", "c"]));
        install(&ns, "b", 1, raw(2, &["d"]));
        install(&ns, "c", 2, raw(3, &["d"]));
        install(&ns, "d", 3, raw(4, &[]));

        let state = ns.state.read().unwrap();
        let plan = build_plan(&state, "a", &Labels::empty(), &[], 1).unwrap();
        let order: Vec<&str> = plan.iter().map(|p| p.document.name.as_str()).collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order.first(), Some(&"d"));
        assert_eq!(order.last(), Some(&"a"));
    }

    #[test]
    fn cycles_are_rejected() {
        let ns = ConfigNamespace::new(1, PathBuf::from("/cfg"));
        install(&ns, "a", 0, raw(1, &["b"]));
        install(&ns, "b", 1, raw(2, &["c"]));
        install(&ns, "c", 2, raw(3, &["a"]));

        let state = ns.state.read().unwrap();
        let err = build_plan(&state, "a", &Labels::empty(), &[], 1).unwrap_err();
        assert!(matches!(err, ResolveError::RefGraphIsNotDag { .. }));
    }

    #[test]
    fn missing_reference_fails() {
        let ns = ConfigNamespace::new(1, PathBuf::from("/cfg"));
        install(&ns, "a", 0, raw(1, &["ghost"]));

        let state = ns.state.read().unwrap();
        let err = build_plan(&state, "a", &Labels::empty(), &[], 1).unwrap_err();
        assert!(matches!(err, ResolveError::MissingDocument { document } if document == "ghost"));
    }
}
