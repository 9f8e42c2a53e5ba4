use std::path::PathBuf;

use thiserror::Error;

/// Why a request could not be served. Each variant maps onto one API
/// status code; see [`crate::api::ApiStatus`].
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("the reference graph of '{document}' has a cycle: [{path}]")]
    RefGraphIsNotDag { document: String, path: String },

    #[error("there is no document '{document}' for the requested labels")]
    MissingDocument { document: String },

    #[error("version {version} is below the oldest stored version")]
    InvalidVersion { version: u32 },

    #[error("the tag expansion exceeded the depth limit")]
    DepthLimit,

    #[error("the namespace is deleted")]
    NamespaceDeleted,

    #[error("the build failed: {reason}")]
    Build { reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("the root path '{0}' isn't a valid absolute path")]
    RootPath(PathBuf),

    #[error("the document '{0}' doesn't have a valid name")]
    DocumentName(String),

    #[error("the template '{0}' doesn't have a valid name")]
    TemplateName(String),

    #[error("the label key '{0}' is repeated")]
    RepeatedLabelKey(String),

    #[error("the flavor '{0}' is repeated")]
    RepeatedFlavor(String),

    #[error("the flavor '{0}' isn't a valid name")]
    FlavorName(String),

    #[error("the path '{0}' isn't a valid relative path")]
    RelativePath(String),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("can't index '{path}': {source}")]
    Index {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("can't parse '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("the namespace is deleted")]
    NamespaceDeleted,
}
