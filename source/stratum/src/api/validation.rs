use std::collections::HashSet;
use std::path::Path;

use stratum_model::Labels;

use crate::error::ValidationError;

/// Absolute, no `.`/`..` components, no empty components.
pub fn is_valid_absolute_path(path: &Path) -> bool {
    let Some(s) = path.to_str() else {
        return false;
    };
    let Some(rest) = s.strip_prefix('/') else {
        return false;
    };
    rest.is_empty() || is_valid_relative_str(rest)
}

/// Relative, no `.`/`..` components, no empty components, no leading `/`.
pub fn is_valid_relative_path(path: &str) -> bool {
    !path.is_empty() && is_valid_relative_str(path)
}

fn is_valid_relative_str(path: &str) -> bool {
    path.split('/').all(|component| {
        !component.is_empty() && component != "." && component != ".."
    })
}

/// Documents are filename stems: non-empty, no separator, and the reserved
/// leading characters belong to hidden files and templates.
pub fn is_valid_document_name(document: &str) -> bool {
    !document.is_empty()
        && !document.contains('/')
        && !document.starts_with('.')
        && !document.starts_with('_')
}

pub fn is_valid_flavor(flavor: &str) -> bool {
    !flavor.is_empty() && !flavor.contains('/') && !flavor.contains('.')
}

pub fn check_get_arguments(
    root_path: &Path,
    labels: &Labels,
    document: &str,
    flavors: &[String],
    template: Option<&str>,
) -> Result<(), ValidationError> {
    if !is_valid_absolute_path(root_path) {
        return Err(ValidationError::RootPath(root_path.to_path_buf()));
    }
    if !is_valid_document_name(document) {
        return Err(ValidationError::DocumentName(document.to_string()));
    }
    if let Some(template) = template {
        if !template.starts_with('_') || template.contains('/') {
            return Err(ValidationError::TemplateName(template.to_string()));
        }
    }
    if !labels.has_unique_keys() {
        let repeated = labels
            .windows(2)
            .find(|w| w[0].0 == w[1].0)
            .map(|w| w[0].0.clone())
            .unwrap_or_default();
        return Err(ValidationError::RepeatedLabelKey(repeated));
    }
    let mut seen = HashSet::new();
    for flavor in flavors {
        if !is_valid_flavor(flavor) {
            return Err(ValidationError::FlavorName(flavor.clone()));
        }
        if !seen.insert(flavor) {
            return Err(ValidationError::RepeatedFlavor(flavor.clone()));
        }
    }
    Ok(())
}

pub fn check_update_arguments(
    root_path: &Path,
    relative_paths: &[String],
) -> Result<(), ValidationError> {
    if !is_valid_absolute_path(root_path) {
        return Err(ValidationError::RootPath(root_path.to_path_buf()));
    }
    for path in relative_paths {
        if !is_valid_relative_path(path) {
            return Err(ValidationError::RelativePath(path.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn absolute_path_rules() {
        assert!(is_valid_absolute_path(Path::new("/etc/configs")));
        assert!(is_valid_absolute_path(Path::new("/")));
        assert!(!is_valid_absolute_path(Path::new("etc/configs")));
        assert!(!is_valid_absolute_path(Path::new("/etc/../configs")));
        assert!(!is_valid_absolute_path(Path::new("/etc/./configs")));
        assert!(!is_valid_absolute_path(Path::new("/etc//configs")));
        assert!(!is_valid_absolute_path(Path::new("")));
    }

    #[test]
    fn relative_path_rules() {
        assert!(is_valid_relative_path("env/prod/db.yaml"));
        assert!(is_valid_relative_path("db.yaml"));
        assert!(!is_valid_relative_path("/db.yaml"));
        assert!(!is_valid_relative_path("env/../db.yaml"));
        // Dot-prefixed names are path-valid; the indexer just never loads them.
        assert!(is_valid_relative_path(".hidden/db.yaml"));
        assert!(!is_valid_relative_path(""));
    }

    #[test]
    fn document_name_rules() {
        assert!(is_valid_document_name("db"));
        assert!(!is_valid_document_name(""));
        assert!(!is_valid_document_name("a/b"));
        assert!(!is_valid_document_name(".hidden"));
        assert!(!is_valid_document_name("_tmpl.conf.j2"));
    }

    #[test]
    fn get_argument_checks() {
        let root = PathBuf::from("/etc/configs");
        let ok = check_get_arguments(
            &root,
            &stratum_model::labels! {"env" => "prod"},
            "db",
            &["cache".to_string()],
            Some("_tmpl.db.conf"),
        );
        assert!(ok.is_ok());

        let dup = stratum_model::Labels::new(vec![
            ("env".into(), "a".into()),
            ("env".into(), "b".into()),
        ]);
        assert!(check_get_arguments(&root, &dup, "db", &[], None).is_err());
        assert!(check_get_arguments(&root, &Labels::empty(), "db", &[], Some("tmpl")).is_err());
        assert!(
            check_get_arguments(&root, &Labels::empty(), "db", &["a".into(), "a".into()], None)
                .is_err()
        );
    }
}
