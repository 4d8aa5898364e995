//! `relay session`: the process a session runs in.
//!
//! Reports itself to the daemon through the session-started webhook, then
//! replaces itself with the agent command. Exec keeps the reported PID valid
//! for the life of the session, so daemon signals reach the agent directly
//! and the agent's exit status becomes ours.

use relay_daemon_protocol::{SessionMetadata, SessionStartedRequest, StartedBy};
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use crate::daemon_client::{running_daemon, DaemonClient};
use crate::error::{CliError, Result};

pub const AGENT_COMMAND_ENV: &str = "RELAY_AGENT_COMMAND";
pub const SESSION_ID_ENV: &str = "RELAY_SESSION_ID";
const DEFAULT_AGENT: &str = "claude";

pub struct SessionOptions {
    pub session_id: Option<String>,
    pub started_by: StartedBy,
    /// Port handed down by the daemon when it spawned us.
    pub daemon_port: Option<u16>,
    pub agent: Vec<String>,
}

pub fn run(home: &Path, options: SessionOptions) -> Result<Infallible> {
    let session_id = options
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let cwd = std::env::current_dir().map_err(|err| CliError::io("read current directory", err))?;

    let port = options
        .daemon_port
        .or_else(|| running_daemon(home).map(|record| record.http_port));
    match port {
        Some(port) => {
            let request = session_request(
                &session_id,
                std::process::id(),
                options.started_by,
                &cwd.display().to_string(),
            );
            match DaemonClient::for_port(port).and_then(|client| client.session_started(&request)) {
                Ok(_) => tracing::debug!(session_id = %session_id, port, "Reported to daemon"),
                Err(err) => tracing::warn!(error = %err, "Failed to report session to daemon"),
            }
        }
        None => tracing::warn!("No daemon running; session will not be tracked"),
    }

    let argv = agent_command(options.agent, std::env::var(AGENT_COMMAND_ENV).ok());
    let (program, args) = argv.split_first().ok_or_else(|| CliError::AgentLaunch {
        program: String::new(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty agent command"),
    })?;
    let err = Command::new(program)
        .args(args)
        .env(SESSION_ID_ENV, &session_id)
        .exec();
    Err(CliError::AgentLaunch {
        program: program.clone(),
        source: err,
    })
}

pub fn session_request(
    session_id: &str,
    host_pid: u32,
    started_by: StartedBy,
    path: &str,
) -> SessionStartedRequest {
    let mut extra = Map::new();
    extra.insert(
        "hostVersion".to_string(),
        Value::String(env!("CARGO_PKG_VERSION").to_string()),
    );
    SessionStartedRequest {
        session_id: session_id.to_string(),
        metadata: SessionMetadata {
            host_pid,
            started_by: Some(started_by),
            path: Some(path.to_string()),
            extra,
        },
    }
}

/// Explicit arguments win, then `RELAY_AGENT_COMMAND` (whitespace-split),
/// then the default agent.
pub fn agent_command(explicit: Vec<String>, from_env: Option<String>) -> Vec<String> {
    if !explicit.is_empty() {
        return explicit;
    }
    from_env
        .map(|raw| raw.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|argv| !argv.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_AGENT.to_string()])
}
