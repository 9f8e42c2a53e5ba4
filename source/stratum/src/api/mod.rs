pub mod auth;
pub mod validation;
pub mod wire;

use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use stratum_model::{Element, Labels, Origin};

use crate::error::ResolveError;

/// Transport-agnostic status codes mirrored by every response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    Ok,
    Error,
    InvalidVersion,
    RefGraphIsNotDag,
    PermissionDenied,
    InvalidArgument,
    Unauthenticated,
}

impl From<&ResolveError> for ApiStatus {
    fn from(err: &ResolveError) -> ApiStatus {
        match err {
            ResolveError::RefGraphIsNotDag { .. } => ApiStatus::RefGraphIsNotDag,
            ResolveError::InvalidVersion { .. } => ApiStatus::InvalidVersion,
            _ => ApiStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Debug = 2,
    Trace = 3,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Error
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub origin: Origin,
}

/// Per-request log. Producers (parser, merger, tag expander) append leveled
/// events; only entries at or below the requested level are retained for
/// delivery. Errors are additionally forwarded to the process sink.
#[derive(Debug)]
pub struct RequestLog {
    level: LogLevel,
    entries: Mutex<Vec<LogEntry>>,
}

impl RequestLog {
    pub fn new(level: LogLevel) -> RequestLog {
        RequestLog {
            level,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>, origin: Origin) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!(target: "stratum::request", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "stratum::request", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "stratum::request", "{message}"),
            LogLevel::Trace => tracing::trace!(target: "stratum::request", "{message}"),
        }
        if level <= self.level {
            self.entries.lock().unwrap().push(LogEntry {
                level,
                message,
                origin,
            });
        }
    }

    pub fn error(&self, message: impl Into<String>, origin: Origin) {
        self.push(LogLevel::Error, message, origin);
    }

    pub fn warn(&self, message: impl Into<String>, origin: Origin) {
        self.push(LogLevel::Warn, message, origin);
    }

    pub fn debug(&self, message: impl Into<String>, origin: Origin) {
        self.push(LogLevel::Debug, message, origin);
    }

    pub fn trace(&self, message: impl Into<String>, origin: Origin) {
        self.push(LogLevel::Trace, message, origin);
    }

    pub fn take(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock().unwrap())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub root_path: PathBuf,
    pub labels: Labels,
    pub document: String,
    /// Flavor suffixes to layer on top of the flavorless entries, in
    /// precedence order.
    pub flavors: Vec<String>,
    /// 0 selects the current version.
    pub version: u32,
    /// Template document to render over the resolved element.
    pub template: Option<String>,
    pub log_level: LogLevel,
    pub with_position: bool,
    pub token: Option<String>,
}

/// One contributing source file of a response, addressed by the positions in
/// the wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub document_id: u16,
    pub raw_config_id: u32,
    pub checksum: u32,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    pub status: ApiStatus,
    pub namespace_id: u64,
    pub version: u32,
    pub element: Option<Element>,
    pub checksum: [u8; 32],
    /// Wire-encoded element stream, or the rendered template when the
    /// request named one.
    pub payload: Option<Bytes>,
    pub sources: Vec<SourceInfo>,
    pub logs: Vec<LogEntry>,
}

impl GetResponse {
    pub fn failure(status: ApiStatus, logs: Vec<LogEntry>) -> GetResponse {
        GetResponse {
            status,
            namespace_id: 0,
            version: 0,
            element: None,
            checksum: [0; 32],
            payload: None,
            sources: Vec::new(),
            logs,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub root_path: PathBuf,
    /// Re-index the whole tree instead of the listed paths.
    pub reload: bool,
    pub relative_paths: Vec<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Ok,
    Error,
    PermissionDenied,
    InvalidArgument,
    Unauthenticated,
}

#[derive(Debug, Clone)]
pub struct UpdateResponse {
    pub status: UpdateStatus,
    pub namespace_id: u64,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Ok,
    Error,
    InvalidVersion,
    RefGraphIsNotDag,
    PermissionDenied,
    InvalidArgument,
    Unauthenticated,
    UidInUse,
    UnknownUid,
    Removed,
}

impl From<ApiStatus> for WatchStatus {
    fn from(status: ApiStatus) -> WatchStatus {
        match status {
            ApiStatus::Ok => WatchStatus::Ok,
            ApiStatus::Error => WatchStatus::Error,
            ApiStatus::InvalidVersion => WatchStatus::InvalidVersion,
            ApiStatus::RefGraphIsNotDag => WatchStatus::RefGraphIsNotDag,
            ApiStatus::PermissionDenied => WatchStatus::PermissionDenied,
            ApiStatus::InvalidArgument => WatchStatus::InvalidArgument,
            ApiStatus::Unauthenticated => WatchStatus::Unauthenticated,
        }
    }
}

/// One event on a watch stream, mirroring the `Get` result shape.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub uid: u32,
    pub status: WatchStatus,
    pub namespace_id: u64,
    pub version: u32,
    pub element: Option<Element>,
    pub checksum: [u8; 32],
    pub payload: Option<Bytes>,
    pub sources: Vec<SourceInfo>,
    pub logs: Vec<LogEntry>,
}

impl WatchEvent {
    pub fn status_only(uid: u32, status: WatchStatus) -> WatchEvent {
        WatchEvent {
            uid,
            status,
            namespace_id: 0,
            version: 0,
            element: None,
            checksum: [0; 32],
            payload: None,
            sources: Vec::new(),
            logs: Vec::new(),
        }
    }
}

/// Delivery seam between the engine and the stream transport. `deliver`
/// returns false once the peer is gone, which cancels further work for the
/// task at its next natural boundary.
pub trait EventSink<T>: Send + Sync {
    fn deliver(&self, event: T) -> bool;
}

impl<T: Send + 'static> EventSink<T> for tokio::sync::mpsc::UnboundedSender<T> {
    fn deliver(&self, event: T) -> bool {
        self.send(event).is_ok()
    }
}
