//! `relay daemon ...` subcommands.

use relay_daemon_protocol::{SpawnOutcome, SpawnSessionRequest};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::daemon_client::{is_pid_alive, running_daemon, state_path, DaemonClient};
use crate::error::{CliError, Result};

const DAEMON_BINARY_NAME: &str = "relay-daemon";
const START_TIMEOUT: Duration = Duration::from_secs(15);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `relay-daemon` next to this executable, else whatever is on `PATH`.
fn daemon_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_BINARY_NAME)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY_NAME))
}

pub fn start(home: &Path) -> Result<()> {
    if let Some(record) = running_daemon(home) {
        println!(
            "Daemon already running (PID {}, port {})",
            record.pid, record.http_port
        );
        return Ok(());
    }

    let binary = daemon_binary();
    let mut command = Command::new(&binary);
    command
        .env(crate::daemon_client::HOME_DIR_ENV, home)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .map_err(|err| CliError::io(format!("spawn {}", binary.display()), err))?;
    tracing::debug!(pid = child.id(), "Spawned daemon");

    let deadline = Instant::now() + START_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(record) = running_daemon(home) {
            println!(
                "Daemon started (PID {}, port {})",
                record.pid, record.http_port
            );
            return Ok(());
        }
        // A daemon that exits this early failed startup; don't wait it out.
        if let Ok(Some(status)) = child.try_wait() {
            if running_daemon(home).is_none() {
                tracing::warn!(status = %status, "Daemon exited during startup");
                break;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Err(CliError::StartTimeout {
        secs: START_TIMEOUT.as_secs(),
        log_hint: home.join("logs").display().to_string(),
    })
}

pub fn stop(home: &Path) -> Result<()> {
    let Some(record) = running_daemon(home) else {
        println!("Daemon is not running");
        return Ok(());
    };

    match DaemonClient::for_port(record.http_port).and_then(|client| client.stop()) {
        Ok(_) => tracing::debug!(pid = record.pid, "Stop acknowledged"),
        Err(err) => tracing::warn!(error = %err, "Stop request failed; will signal instead"),
    }

    if wait_for_exit(record.pid, STOP_TIMEOUT) {
        println!("Daemon stopped");
        return Ok(());
    }

    tracing::warn!(pid = record.pid, "Daemon ignored stop; killing");
    // SAFETY: the PID came from a state file whose owner is still alive.
    unsafe {
        libc::kill(record.pid as libc::pid_t, libc::SIGKILL);
    }
    if wait_for_exit(record.pid, Duration::from_secs(2)) {
        // A killed daemon cannot clean up after itself.
        let _ = fs_err::remove_file(state_path(home));
        println!("Daemon killed");
        return Ok(());
    }
    Err(CliError::StopTimeout {
        pid: record.pid,
        secs: STOP_TIMEOUT.as_secs(),
    })
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_pid_alive(pid) {
            return true;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    !is_pid_alive(pid)
}

pub fn status(home: &Path) -> Result<()> {
    match running_daemon(home) {
        Some(record) => {
            println!("Daemon running");
            println!("  pid:            {}", record.pid);
            println!("  port:           {}", record.http_port);
            println!("  started:        {}", record.start_time);
            println!("  version:        {}", record.started_with_cli_version);
            println!("  last heartbeat: {}", record.last_heartbeat);
            if !record.daemon_log_path.is_empty() {
                println!("  log:            {}", record.daemon_log_path);
            }
        }
        None => println!("Daemon is not running"),
    }
    Ok(())
}

pub fn list(home: &Path) -> Result<()> {
    let children = DaemonClient::from_state(home)?.list()?.children;
    if children.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    println!("{:<8} {:<10} SESSION", "PID", "STARTED BY");
    for child in children {
        println!(
            "{:<8} {:<10} {}",
            child.pid,
            child.started_by.as_str(),
            child.happy_session_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub fn stop_session(home: &Path, session_id: &str) -> Result<()> {
    let response = DaemonClient::from_state(home)?.stop_session(session_id)?;
    if response.success {
        println!("Stopping session {}", session_id);
    } else {
        println!("No such session: {}", session_id);
    }
    Ok(())
}

pub fn spawn(home: &Path, directory: &Path, session_id: Option<String>, approve: bool) -> Result<()> {
    let directory = if directory.is_absolute() {
        directory.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| CliError::io("resolve current directory", err))?
            .join(directory)
    };
    let request = SpawnSessionRequest {
        directory: directory.display().to_string(),
        session_id,
        approved_new_directory_creation: approve,
    };
    let response = DaemonClient::from_state(home)?.spawn_session(&request)?;
    match response.outcome() {
        SpawnOutcome::Started {
            session_id,
            created_directory,
        } => {
            if created_directory {
                println!("Created {}", directory.display());
            }
            println!("Session started: {}", session_id);
            Ok(())
        }
        SpawnOutcome::ApprovalRequired { directory } => {
            println!(
                "{} does not exist. Re-run with --approve to create it.",
                directory
            );
            Ok(())
        }
        SpawnOutcome::Failed { error, reason } => Err(CliError::Daemon {
            reason: reason.unwrap_or("spawn-failed").to_string(),
            message: error.to_string(),
        }),
    }
}
