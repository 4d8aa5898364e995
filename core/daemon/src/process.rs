//! Process inspection and signalling helpers.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signal-0 liveness probe. A process we may not signal (EPERM) still exists.
pub fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    }
    let rc = unsafe { libc::kill(pid as i32, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Asks the process to exit (SIGTERM).
pub fn request_termination(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are unix-only",
        ))
    }
}

fn force_kill(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are unix-only",
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    NotRunning,
    Exited,
    Killed,
}

/// Polls until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Second phase of a two-phase stop: SIGKILL if still alive after `grace`.
pub async fn escalate_after(pid: u32, grace: Duration) -> TerminateOutcome {
    if wait_for_exit(pid, grace).await {
        return TerminateOutcome::Exited;
    }
    warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM; sending SIGKILL");
    if let Err(err) = force_kill(pid) {
        debug!(pid, error = %err, "SIGKILL failed");
    }
    TerminateOutcome::Killed
}

/// SIGTERM, then SIGKILL after `grace`.
pub async fn terminate(pid: u32, grace: Duration) -> TerminateOutcome {
    if !is_pid_alive(pid) {
        return TerminateOutcome::NotRunning;
    }
    if let Err(err) = request_termination(pid) {
        debug!(pid, error = %err, "SIGTERM failed");
        if !is_pid_alive(pid) {
            return TerminateOutcome::NotRunning;
        }
    }
    escalate_after(pid, grace).await
}

/// Modification time of `path` in Unix epoch milliseconds.
pub fn binary_mtime_ms(path: &Path) -> Option<i64> {
    let modified = fs_err::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}
