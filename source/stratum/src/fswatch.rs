use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::api::UpdateRequest;
use crate::service::Service;

/// Optional auto-update mode: watch every registered root tree and feed
/// changes through the ordinary update protocol, so watchers and version
/// history behave exactly as if a client had sent `Update(reload)`.
pub struct ConfigWatcher {
    service: Service,
}

impl ConfigWatcher {
    pub fn new(service: Service) -> ConfigWatcher {
        ConfigWatcher { service }
    }

    pub async fn watch(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        tracing::info!("starting the filesystem watcher");

        let (tx, mut rx) = mpsc::channel::<Event>(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                    let _ = tx.blocking_send(event);
                }
            }
        })?;

        let mut watched: HashSet<PathBuf> = HashSet::new();
        loop {
            // Keep the watch set in sync with the registry between events.
            for root in self.service.registry().roots().iter() {
                if watched.insert(root.clone()) {
                    if let Err(err) = watcher.watch(root, RecursiveMode::Recursive) {
                        tracing::warn!(root = %root.display(), "can't watch the root: {err}");
                        watched.remove(root);
                    }
                }
            }

            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
            };

            // Debounce: editors fire bursts of events per save.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut events = vec![event];
            while let Ok(more) = rx.try_recv() {
                events.push(more);
            }

            let roots = self.service.registry().roots();
            let mut touched: HashSet<PathBuf> = HashSet::new();
            for event in &events {
                for path in &event.paths {
                    if let Some(root) = roots.iter().find(|root| path.starts_with(root)) {
                        touched.insert(root.clone());
                    }
                }
            }

            for root in touched {
                tracing::info!(root = %root.display(), "reloading after filesystem change");
                let response = self
                    .service
                    .update(UpdateRequest {
                        root_path: root.clone(),
                        reload: true,
                        relative_paths: Vec::new(),
                        token: None,
                    })
                    .await;
                tracing::debug!(root = %root.display(), status = ?response.status, "reload done");
            }
        }
    }
}
