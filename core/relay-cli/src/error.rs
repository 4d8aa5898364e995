//! Error type for the `relay` CLI.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Daemon is not running (no live state file at {0})")]
    DaemonNotRunning(PathBuf),

    #[error("Daemon did not come up within {secs}s (see {log_hint})")]
    StartTimeout { secs: u64, log_hint: String },

    #[error("Daemon (PID {pid}) did not exit within {secs}s")]
    StopTimeout { pid: u32, secs: u64 },

    #[error("Daemon rejected request: {reason}: {message}")]
    Daemon { reason: String, message: String },

    #[error("Request to daemon failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to run {program}: {source}")]
    AgentLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CliError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        CliError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;
