//! Session spawning: directory approval and child launch.
//!
//! # Directory Approval
//!
//! ```text
//! no-directory ──(request without approval)──▶ pending-approval   (409, nothing created)
//!      │
//!      └──(request with approval)──▶ approved ──create_dir_all──▶ created
//! ```
//!
//! A remote caller can name any path, so a missing directory is only created
//! after a human confirms it. Filesystem failures map to distinct reasons so
//! the caller can show an actionable message.

use relay_daemon_protocol::{SpawnSessionRequest, SpawnSessionResponse};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SessionCommand;
use crate::registry::ProcessRegistry;

pub const DAEMON_PORT_ENV: &str = "RELAY_DAEMON_HTTP_PORT";
pub const STARTED_BY_ENV: &str = "RELAY_STARTED_BY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStage {
    NoDirectory,
    PendingApproval,
    Approved,
    Created,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsFailure {
    PermissionDenied,
    NotADirectory,
    DiskFull,
    ReadOnlyFilesystem,
    Other,
}

impl FsFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            FsFailure::PermissionDenied => "permission-denied",
            FsFailure::NotADirectory => "not-a-directory",
            FsFailure::DiskFull => "disk-full",
            FsFailure::ReadOnlyFilesystem => "read-only-filesystem",
            FsFailure::Other => "io-error",
        }
    }

    pub fn classify(err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return FsFailure::PermissionDenied;
        }
        match err.raw_os_error() {
            Some(code) if code == libc::EACCES || code == libc::EPERM => {
                FsFailure::PermissionDenied
            }
            Some(code) if code == libc::ENOTDIR || code == libc::EEXIST => {
                FsFailure::NotADirectory
            }
            Some(code) if code == libc::ENOSPC => FsFailure::DiskFull,
            Some(code) if code == libc::EROFS => FsFailure::ReadOnlyFilesystem,
            _ => FsFailure::Other,
        }
    }

    fn message(&self, directory: &str, err: &std::io::Error) -> String {
        match self {
            FsFailure::PermissionDenied => format!(
                "Permission denied: cannot create or enter '{}'. Check write access to the parent directory.",
                directory
            ),
            FsFailure::NotADirectory => format!(
                "'{}' or one of its parents exists but is not a directory.",
                directory
            ),
            FsFailure::DiskFull => format!(
                "No space left on device while creating '{}'.",
                directory
            ),
            FsFailure::ReadOnlyFilesystem => format!(
                "'{}' is on a read-only filesystem.",
                directory
            ),
            FsFailure::Other => format!("Failed to prepare '{}': {}", directory, err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnFailure {
    pub reason: &'static str,
    pub message: String,
}

impl SpawnFailure {
    fn from_fs(directory: &str, err: &std::io::Error) -> Self {
        let failure = FsFailure::classify(err);
        Self {
            reason: failure.reason(),
            message: failure.message(directory, err),
        }
    }

    pub fn into_response(self) -> SpawnSessionResponse {
        SpawnSessionResponse::failed(self.reason, self.message)
    }
}

/// Moves `directory` through the approval state machine.
///
/// Returns the terminal stage: `Existing`, `Created`, or `PendingApproval`.
pub async fn prepare_directory(
    directory: &str,
    approved: bool,
) -> Result<DirectoryStage, SpawnFailure> {
    let path = Path::new(directory);
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Ok(DirectoryStage::Existing),
        Ok(_) => {
            return Err(SpawnFailure {
                reason: FsFailure::NotADirectory.reason(),
                message: format!("'{}' exists but is not a directory.", directory),
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(SpawnFailure::from_fs(directory, &err)),
    }

    let from = DirectoryStage::NoDirectory;
    if !approved {
        let to = DirectoryStage::PendingApproval;
        debug!(directory, ?from, ?to, "Directory creation needs approval");
        return Ok(to);
    }

    let to = DirectoryStage::Approved;
    debug!(directory, ?from, ?to, "Creating approved directory");
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| SpawnFailure::from_fs(directory, &err))?;
    info!(directory, "Created session directory");
    Ok(DirectoryStage::Created)
}

/// Launches the session command and waits for its webhook.
///
/// The child is tracked immediately and a reaper task removes it from the
/// registry when it exits.
pub async fn launch_session(
    registry: &Arc<ProcessRegistry>,
    command: &SessionCommand,
    request: &SpawnSessionRequest,
    http_port: u16,
    webhook_timeout: Duration,
) -> Result<String, SpawnFailure> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    if let Some(session_id) = request.session_id.as_deref() {
        cmd.arg("--session-id").arg(session_id);
    }
    cmd.current_dir(&request.directory)
        .env(DAEMON_PORT_ENV, http_port.to_string())
        .env(STARTED_BY_ENV, "daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|err| SpawnFailure {
        reason: "spawn-failed",
        message: format!(
            "Failed to start {}: {}",
            command.program.display(),
            err
        ),
    })?;
    let pid = child.id().ok_or_else(|| SpawnFailure {
        reason: "spawn-failed",
        message: "Spawned process exited before reporting a PID".to_string(),
    })?;

    registry.register_spawned(pid, &request.directory);
    let webhook = registry.expect_webhook(pid);

    let reaper_registry = Arc::clone(registry);
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(pid, status = %status, "Session process exited"),
            Err(err) => warn!(pid, error = %err, "Failed to wait on session process"),
        }
        reaper_registry.remove_by_pid(pid);
    });

    info!(
        pid,
        directory = %request.directory,
        program = %command.program.display(),
        "Spawned session process"
    );

    match tokio::time::timeout(webhook_timeout, webhook).await {
        Ok(Ok(session_id)) => Ok(session_id),
        Ok(Err(_)) => Err(SpawnFailure {
            reason: "session-exited",
            message: format!("Session process {} exited before reporting in", pid),
        }),
        Err(_) => {
            registry.cancel_webhook(pid);
            warn!(pid, "Timed out waiting for session webhook");
            Err(SpawnFailure {
                reason: "webhook-timeout",
                message: format!(
                    "Session process {} did not report within {}s",
                    pid,
                    webhook_timeout.as_secs()
                ),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_directory_without_approval_is_not_created() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let target = temp_dir.path().join("does-not-exist");
        let stage = prepare_directory(&target.display().to_string(), false)
            .await
            .expect("prepare");
        assert_eq!(stage, DirectoryStage::PendingApproval);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn approved_directory_is_created_recursively() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let target = temp_dir.path().join("a").join("b");
        let stage = prepare_directory(&target.display().to_string(), true)
            .await
            .expect("prepare");
        assert_eq!(stage, DirectoryStage::Created);
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn existing_directory_needs_no_approval() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let stage = prepare_directory(&temp_dir.path().display().to_string(), false)
            .await
            .expect("prepare");
        assert_eq!(stage, DirectoryStage::Existing);
    }

    #[tokio::test]
    async fn file_in_the_way_is_not_a_directory() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let file = temp_dir.path().join("plain-file");
        fs_err::write(&file, b"x").expect("write");

        let direct = prepare_directory(&file.display().to_string(), true)
            .await
            .expect_err("file is not a directory");
        assert_eq!(direct.reason, "not-a-directory");

        let nested = prepare_directory(&file.join("child").display().to_string(), true)
            .await
            .expect_err("parent is a file");
        assert_eq!(nested.reason, "not-a-directory");
    }

    #[test]
    fn classifies_errno_values() {
        let cases = [
            (libc::EACCES, "permission-denied"),
            (libc::ENOTDIR, "not-a-directory"),
            (libc::ENOSPC, "disk-full"),
            (libc::EROFS, "read-only-filesystem"),
            (libc::EIO, "io-error"),
        ];
        for (code, reason) in cases {
            let err = std::io::Error::from_raw_os_error(code);
            assert_eq!(FsFailure::classify(&err).reason(), reason);
        }
    }
}
