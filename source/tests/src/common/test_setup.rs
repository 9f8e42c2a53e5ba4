use std::path::PathBuf;
use std::sync::Arc;

use stratum::api::auth::AllowAll;
use stratum::api::{GetRequest, GetResponse, LogLevel, UpdateRequest, UpdateResponse};
use stratum::service::Service;
use stratum_model::Labels;
use tempfile::TempDir;

/// One namespace root on disk plus a service to drive it.
pub struct Fixture {
    dir: TempDir,
    pub service: Service,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture {
            dir: tempfile::tempdir().expect("tempdir"),
            service: Service::new(Arc::new(AllowAll)),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn write(&self, rel_path: &str, content: &str) {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, content).expect("write fixture file");
    }

    pub fn remove(&self, rel_path: &str) {
        std::fs::remove_file(self.dir.path().join(rel_path)).expect("remove fixture file");
    }

    pub fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub async fn get(&self, document: &str, labels: &[(&str, &str)]) -> GetResponse {
        self.get_at(document, labels, 0).await
    }

    pub async fn get_at(
        &self,
        document: &str,
        labels: &[(&str, &str)],
        version: u32,
    ) -> GetResponse {
        self.service
            .get(GetRequest {
                root_path: self.root(),
                labels: Self::labels(labels),
                document: document.to_string(),
                version,
                log_level: LogLevel::Warn,
                ..GetRequest::default()
            })
            .await
    }

    pub async fn get_full(&self, req: GetRequest) -> GetResponse {
        self.service.get(req).await
    }

    pub async fn update(&self, reload: bool, paths: &[&str]) -> UpdateResponse {
        self.service
            .update(UpdateRequest {
                root_path: self.root(),
                reload,
                relative_paths: paths.iter().map(|p| p.to_string()).collect(),
                token: None,
            })
            .await
    }
}
