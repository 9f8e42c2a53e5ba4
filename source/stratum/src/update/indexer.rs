use std::path::{Path, PathBuf};

use stratum_model::yaml::parse_document;
use stratum_model::{Element, Labels, StringPool};

use crate::error::UpdateError;

/// Identity of one source slot, derived entirely from its path relative to
/// the namespace root: directory components pair up into labels, the
/// filename carries the document and optional flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub override_path: String,
    pub labels: Labels,
    pub document: String,
    pub flavor: Option<String>,
}

/// Parsed content of one file, ready to become a `RawConfig`.
#[derive(Debug, Clone)]
pub struct RawSeed {
    pub checksum: u32,
    pub value: Element,
    pub references: Vec<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub identity: FileIdentity,
    /// `None` when the file no longer exists on disk (a deletion).
    pub seed: Option<RawSeed>,
}

/// `<document>[.<flavor>].yaml` declares a document; filenames starting
/// with `.` are ignored; `_text.` / `_bin.` / `_tmpl.` prefixes declare
/// template documents whose name keeps the prefix and the real extension.
/// Returns `None` for files the indexer doesn't own.
pub fn parse_rel_path(rel_path: &str) -> Option<FileIdentity> {
    let (dir, filename) = match rel_path.rsplit_once('/') {
        Some((dir, filename)) => (Some(dir), filename),
        None => (None, rel_path),
    };
    if filename.starts_with('.') || filename.is_empty() {
        return None;
    }
    if rel_path.split('/').any(|c| c.starts_with('.')) {
        return None;
    }

    let labels = match dir {
        None => Labels::empty(),
        Some(dir) => {
            let components: Vec<&str> = dir.split('/').collect();
            if components.len() % 2 != 0 {
                tracing::warn!(
                    rel_path,
                    "override directories must pair up into key/value labels"
                );
                return None;
            }
            Labels::new(
                components
                    .chunks(2)
                    .map(|pair| (pair[0].to_string(), pair[1].to_string()))
                    .collect(),
            )
        }
    };

    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }

    if let Some(kind) = ["_text", "_bin", "_tmpl"]
        .iter()
        .find(|k| stem.starts_with(&format!("{k}.")))
    {
        let rest = &stem[kind.len() + 1..];
        let (name, flavor) = match rest.split_once('.') {
            Some((name, flavor)) => (name, Some(flavor.to_string())),
            None => (rest, None),
        };
        if name.is_empty() {
            return None;
        }
        return Some(FileIdentity {
            override_path: rel_path.to_string(),
            labels,
            document: format!("{kind}.{name}.{ext}"),
            flavor,
        });
    }
    if stem.starts_with('_') {
        return None;
    }

    if ext != "yaml" {
        return None;
    }
    let (name, flavor) = match stem.split_once('.') {
        Some((name, flavor)) => (name, Some(flavor.to_string())),
        None => (stem, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(FileIdentity {
        override_path: rel_path.to_string(),
        labels,
        document: name.to_string(),
        flavor,
    })
}

async fn load_seed(
    pool: &StringPool,
    root: &Path,
    identity: &FileIdentity,
) -> Result<Option<RawSeed>, UpdateError> {
    let path = root.join(&identity.override_path);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(UpdateError::Index {
                path,
                source: err,
            })
        }
    };
    let checksum = crc32fast::hash(&bytes);

    if identity.document.starts_with("_bin.") {
        return Ok(Some(RawSeed {
            checksum,
            value: Element::bin(pool.intern(&bytes)),
            references: Vec::new(),
            template: None,
        }));
    }

    let text = String::from_utf8_lossy(&bytes);
    if identity.document.starts_with("_text.") {
        return Ok(Some(RawSeed {
            checksum,
            value: Element::str(pool.intern_str(&text)),
            references: Vec::new(),
            template: None,
        }));
    }
    if identity.document.starts_with("_tmpl.") {
        let mut env = minijinja::Environment::new();
        env.template_from_str(&text)
            .map_err(|err| UpdateError::Parse {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        return Ok(Some(RawSeed {
            checksum,
            value: Element::str(pool.intern_str(&text)),
            references: Vec::new(),
            template: Some(text.into_owned()),
        }));
    }

    let parsed = parse_document(pool, &text).map_err(|err| UpdateError::Parse {
        path,
        reason: err.to_string(),
    })?;
    Ok(Some(RawSeed {
        checksum,
        value: parsed.element,
        references: parsed.references,
        template: None,
    }))
}

/// Re-index the whole tree under `root`, skipping dot-prefixed entries.
pub async fn index_tree(pool: &StringPool, root: &Path) -> Result<Vec<IndexedFile>, UpdateError> {
    let mut out = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|err| UpdateError::Index {
            path: dir.clone(),
            source: err,
        })?;
        loop {
            let entry = entries.next_entry().await.map_err(|err| UpdateError::Index {
                path: dir.clone(),
                source: err,
            })?;
            let Some(entry) = entry else {
                break;
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await.map_err(|err| UpdateError::Index {
                path: entry.path(),
                source: err,
            })?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let rel_path = entry
                    .path()
                    .strip_prefix(root)
                    .expect("walk stays under the root")
                    .to_string_lossy()
                    .into_owned();
                if let Some(identity) = parse_rel_path(&rel_path) {
                    let seed = load_seed(pool, root, &identity).await?;
                    out.push(IndexedFile { identity, seed });
                }
            }
        }
    }
    out.sort_by(|a, b| a.identity.override_path.cmp(&b.identity.override_path));
    Ok(out)
}

/// Index only the listed relative paths; files that vanished become
/// deletions.
pub async fn index_paths(
    pool: &StringPool,
    root: &Path,
    rel_paths: &[String],
) -> Result<Vec<IndexedFile>, UpdateError> {
    let mut out = Vec::new();
    for rel_path in rel_paths {
        let Some(identity) = parse_rel_path(rel_path) else {
            tracing::debug!(rel_path, "skipping non-config path in update");
            continue;
        };
        let seed = load_seed(pool, root, &identity).await?;
        out.push(IndexedFile { identity, seed });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_model::labels;

    #[test]
    fn filename_grammar() {
        let id = parse_rel_path("db.yaml").unwrap();
        assert_eq!(id.document, "db");
        assert_eq!(id.flavor, None);
        assert_eq!(id.labels, Labels::empty());

        let id = parse_rel_path("db.cache.yaml").unwrap();
        assert_eq!(id.document, "db");
        assert_eq!(id.flavor.as_deref(), Some("cache"));

        let id = parse_rel_path("env/prod/db.yaml").unwrap();
        assert_eq!(id.labels, labels! {"env" => "prod"});
        assert_eq!(id.document, "db");

        let id = parse_rel_path("env/prod/region/eu/db.yaml").unwrap();
        assert_eq!(id.labels, labels! {"env" => "prod", "region" => "eu"});
    }

    #[test]
    fn template_grammar() {
        let id = parse_rel_path("_tmpl.app.conf").unwrap();
        assert_eq!(id.document, "_tmpl.app.conf");
        assert_eq!(id.flavor, None);

        let id = parse_rel_path("_text.motd.txt").unwrap();
        assert_eq!(id.document, "_text.motd.txt");

        let id = parse_rel_path("_bin.cert.der").unwrap();
        assert_eq!(id.document, "_bin.cert.der");

        let id = parse_rel_path("_text.motd.fancy.txt").unwrap();
        assert_eq!(id.document, "_text.motd.txt");
        assert_eq!(id.flavor.as_deref(), Some("fancy"));

        assert!(parse_rel_path("_other.x.txt").is_none());
    }

    #[test]
    fn ignored_paths() {
        assert!(parse_rel_path(".hidden.yaml").is_none());
        assert!(parse_rel_path("env/.git/db.yaml").is_none());
        assert!(parse_rel_path("db.txt").is_none());
        assert!(parse_rel_path("noext").is_none());
        // An odd directory depth can't pair into labels.
        assert!(parse_rel_path("env/db.yaml").is_none());
    }

    #[tokio::test]
    async fn tree_walk_skips_dot_dirs_and_loads_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("db.yaml"), "host: a\n").unwrap();
        std::fs::create_dir_all(root.join("env/prod")).unwrap();
        std::fs::write(root.join("env/prod/db.yaml"), "host: b\n").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/db.yaml"), "host: c\n").unwrap();
        std::fs::write(root.join("notes.txt"), "ignored").unwrap();

        let pool = StringPool::new();
        let indexed = index_tree(&pool, root).await.unwrap();
        let paths: Vec<&str> = indexed
            .iter()
            .map(|f| f.identity.override_path.as_str())
            .collect();
        assert_eq!(paths, vec!["db.yaml", "env/prod/db.yaml"]);
        assert!(indexed.iter().all(|f| f.seed.is_some()));
    }

    #[tokio::test]
    async fn missing_listed_paths_become_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let pool = StringPool::new();
        let indexed = index_paths(&pool, dir.path(), &["db.yaml".to_string()])
            .await
            .unwrap();
        assert_eq!(indexed.len(), 1);
        assert!(indexed[0].seed.is_none());
    }

    #[tokio::test]
    async fn yaml_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("db.yaml"), "host: [unclosed\n").unwrap();
        let pool = StringPool::new();
        assert!(index_tree(&pool, dir.path()).await.is_err());
    }
}
