//! relay-daemon: per-machine supervisor for agent sessions.
//!
//! The binary in `main.rs` is a thin wrapper around [`supervisor::Supervisor`].

pub mod api;
pub mod backoff;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod lock;
pub mod logging;
pub mod machine;
pub mod process;
pub mod registry;
pub mod shutdown;
pub mod spawn;
pub mod state_file;
pub mod supervisor;

pub use error::{DaemonError, Result};
