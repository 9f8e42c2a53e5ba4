use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use tokio::sync::oneshot;

use super::{ConfigNamespace, NamespaceStatus};

/// What `get_or_build` asks the caller to do.
pub enum Lookup {
    /// Live namespace, ready to serve.
    Ready(Arc<ConfigNamespace>),
    /// Someone else is indexing it; await the receiver, then re-check the
    /// status.
    Wait(Arc<ConfigNamespace>, oneshot::Receiver<()>),
    /// The caller created the entry and owns the initial index.
    MustBuild(Arc<ConfigNamespace>),
}

/// The global root-path table. Structural changes hold its write lock; the
/// hot-swapped root list lets the filesystem watcher read the set of watched
/// trees without touching the table.
pub struct Registry {
    namespaces: RwLock<HashMap<PathBuf, Arc<ConfigNamespace>>>,
    roots: ArcSwap<Vec<PathBuf>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            namespaces: RwLock::new(HashMap::new()),
            roots: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn get(&self, root_path: &Path) -> Option<Arc<ConfigNamespace>> {
        let namespaces = self.namespaces.read().unwrap();
        namespaces
            .get(root_path)
            .filter(|ns| ns.status() != NamespaceStatus::Deleted)
            .cloned()
    }

    pub fn get_or_build(&self, root_path: &Path) -> Lookup {
        if let Some(lookup) = self.lookup_live(root_path) {
            return lookup;
        }

        let mut namespaces = self.namespaces.write().unwrap();
        // Re-check: another task may have inserted while we upgraded.
        if let Some(ns) = namespaces.get(root_path) {
            if let Some(lookup) = Self::classify(ns) {
                return lookup;
            }
        }
        let ns = ConfigNamespace::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            root_path.to_path_buf(),
        );
        namespaces.insert(root_path.to_path_buf(), Arc::clone(&ns));
        self.publish_roots(&namespaces);
        tracing::info!(root_path = %root_path.display(), id = ns.id, "building namespace");
        Lookup::MustBuild(ns)
    }

    fn lookup_live(&self, root_path: &Path) -> Option<Lookup> {
        let namespaces = self.namespaces.read().unwrap();
        let ns = namespaces.get(root_path)?;
        Self::classify(ns)
    }

    fn classify(ns: &Arc<ConfigNamespace>) -> Option<Lookup> {
        let mut state = ns.state.write().unwrap();
        match state.status {
            NamespaceStatus::Deleted => None,
            NamespaceStatus::Building => {
                let (tx, rx) = oneshot::channel();
                state.build_waiters.push(tx);
                Some(Lookup::Wait(Arc::clone(ns), rx))
            }
            NamespaceStatus::Ok | NamespaceStatus::OkUpdating => {
                ns.touch();
                Some(Lookup::Ready(Arc::clone(ns)))
            }
        }
    }

    /// The initial index finished; publish the status and wake the parked
    /// callers.
    pub fn finish_build(&self, ns: &Arc<ConfigNamespace>, ok: bool) {
        let waiters = {
            let mut state = ns.state.write().unwrap();
            state.status = if ok {
                NamespaceStatus::Ok
            } else {
                NamespaceStatus::Deleted
            };
            std::mem::take(&mut state.build_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
        if !ok {
            self.remove(ns);
        }
    }

    /// Unlink a namespace; `mark_deleted` is the caller's business (GC does
    /// it under its own checks, id overflow right away).
    pub fn remove(&self, ns: &Arc<ConfigNamespace>) {
        let mut namespaces = self.namespaces.write().unwrap();
        match namespaces.get(&ns.root_path) {
            Some(current) if Arc::ptr_eq(current, ns) => {
                namespaces.remove(&ns.root_path);
                self.publish_roots(&namespaces);
            }
            _ => {}
        }
    }

    pub fn all(&self) -> Vec<Arc<ConfigNamespace>> {
        self.namespaces.read().unwrap().values().cloned().collect()
    }

    /// Snapshot of the registered root paths, refreshed on every structural
    /// change.
    pub fn roots(&self) -> Arc<Vec<PathBuf>> {
        self.roots.load_full()
    }

    fn publish_roots(&self, namespaces: &HashMap<PathBuf, Arc<ConfigNamespace>>) {
        let mut roots: Vec<PathBuf> = namespaces.keys().cloned().collect();
        roots.sort();
        self.roots.store(Arc::new(roots));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_callers_park_until_the_build_finishes() {
        let registry = Arc::new(Registry::new());
        let root = PathBuf::from("/cfg");

        let Lookup::MustBuild(ns) = registry.get_or_build(&root) else {
            panic!("first caller must own the build");
        };
        let Lookup::Wait(waiting_ns, rx) = registry.get_or_build(&root) else {
            panic!("second caller must park");
        };
        assert!(Arc::ptr_eq(&ns, &waiting_ns));

        registry.finish_build(&ns, true);
        rx.await.unwrap();
        assert_eq!(waiting_ns.status(), NamespaceStatus::Ok);

        let Lookup::Ready(ready) = registry.get_or_build(&root) else {
            panic!("the namespace must now be ready");
        };
        assert!(Arc::ptr_eq(&ready, &ns));
    }

    #[tokio::test]
    async fn failed_builds_leave_no_namespace_behind() {
        let registry = Registry::new();
        let root = PathBuf::from("/cfg");
        let Lookup::MustBuild(ns) = registry.get_or_build(&root) else {
            panic!("first caller must own the build");
        };
        registry.finish_build(&ns, false);
        assert!(registry.get(&root).is_none());
        assert!(matches!(registry.get_or_build(&root), Lookup::MustBuild(_)));
    }

    #[test]
    fn roots_snapshot_tracks_membership() {
        let registry = Registry::new();
        let Lookup::MustBuild(a) = registry.get_or_build(Path::new("/a")) else {
            panic!();
        };
        let Lookup::MustBuild(_b) = registry.get_or_build(Path::new("/b")) else {
            panic!();
        };
        assert_eq!(registry.roots().len(), 2);
        registry.remove(&a);
        assert_eq!(registry.roots().as_slice(), &[PathBuf::from("/b")]);
    }
}
