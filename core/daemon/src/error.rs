//! Error types for relay-daemon startup and lifecycle.

use std::path::PathBuf;

use crate::lock::LockError;

/// Everything that can stop the daemon from starting, plus the few lifecycle
/// failures that callers need to branch on.
///
/// Request-level failures never use this type: the control server maps them
/// to `ControlError` envelopes and the daemon keeps running.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid server URL {url}: {details}")]
    InvalidServerUrl { url: String, details: String },

    #[error("Server URL is configured but no access token was found (set RELAY_TOKEN or write {0})")]
    MissingToken(PathBuf),

    // ─────────────────────────────────────────────────────────────────────
    // Single-instance Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Another daemon is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Failed to bind control server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DaemonError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DaemonError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
