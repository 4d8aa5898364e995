//! End-to-end lifecycle of the `relay-daemon` binary.

use relay_daemon_protocol::{
    ControlErrorBody, DaemonStateRecord, ListResponse, StatusResponse, CONTROL_HOST,
    LOCK_FILE_NAME, ROUTE_LIST, ROUTE_SESSION_STARTED, ROUTE_SPAWN_SESSION, ROUTE_STOP,
    STATE_FILE_NAME,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Kills the daemon if a test fails before stopping it.
struct DaemonGuard {
    child: Option<Child>,
}

impl DaemonGuard {
    fn wait(mut self, timeout: Duration) -> ExitStatus {
        let mut child = self.child.take().expect("child");
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().expect("try_wait") {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                panic!("daemon did not exit within {:?}", timeout);
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn daemon_command(home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_relay-daemon"));
    command
        .env("RELAY_HOME_DIR", home)
        .env("RELAY_HEARTBEAT_INTERVAL_MS", "200")
        .env_remove("RELAY_SERVER_URL")
        .env_remove("RELAY_TOKEN")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

fn start_daemon(home: &Path) -> (DaemonGuard, DaemonStateRecord) {
    let child = daemon_command(home).spawn().expect("spawn daemon");
    let pid = child.id();
    let guard = DaemonGuard { child: Some(child) };
    let record = wait_for_state(&home.join(STATE_FILE_NAME), pid);
    (guard, record)
}

fn wait_for_state(path: &PathBuf, pid: u32) -> DaemonStateRecord {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if let Some(record) = fs_err::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<DaemonStateRecord>(&text).ok())
            .filter(|record| record.pid == pid)
        {
            return record;
        }
        assert!(Instant::now() < deadline, "daemon never wrote its state file");
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn url(record: &DaemonStateRecord, route: &str) -> String {
    format!("http://{}:{}{}", CONTROL_HOST, record.http_port, route)
}

#[test]
fn second_daemon_refuses_to_start() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (daemon, record) = start_daemon(temp_dir.path());

    let status = daemon_command(temp_dir.path())
        .status()
        .expect("run second daemon");
    assert!(!status.success());

    let state: DaemonStateRecord = serde_json::from_str(
        &fs_err::read_to_string(temp_dir.path().join(STATE_FILE_NAME)).expect("state file"),
    )
    .expect("parse state");
    assert_eq!(state.pid, record.pid);
    drop(daemon);
}

#[test]
fn webhook_list_and_spawn_approval() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (_daemon, record) = start_daemon(temp_dir.path());
    let client = reqwest::blocking::Client::new();

    let status: StatusResponse = client
        .post(url(&record, ROUTE_SESSION_STARTED))
        .json(&json!({
            "sessionId": "remote-abc",
            "metadata": { "hostPid": std::process::id(), "startedBy": "terminal" }
        }))
        .send()
        .expect("webhook")
        .json()
        .expect("json");
    assert_eq!(status, StatusResponse::ok());

    let list: ListResponse = client
        .post(url(&record, ROUTE_LIST))
        .send()
        .expect("list")
        .json()
        .expect("json");
    assert_eq!(list.children.len(), 1);
    assert_eq!(list.children[0].happy_session_id.as_deref(), Some("remote-abc"));

    let target = temp_dir.path().join("not-yet");
    let response = client
        .post(url(&record, ROUTE_SPAWN_SESSION))
        .json(&json!({ "directory": target.display().to_string() }))
        .send()
        .expect("spawn");
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().expect("json");
    assert_eq!(body["requiresUserApproval"], true);
    assert!(!target.exists());

    let response = client
        .post(url(&record, ROUTE_SESSION_STARTED))
        .json(&json!({ "metadata": { "hostPid": 1 } }))
        .send()
        .expect("bad webhook");
    assert!(response.status().is_client_error());
    let body: ControlErrorBody = response.json().expect("json");
    assert!(!body.success);
}

#[test]
fn http_stop_exits_cleanly_and_removes_files() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (daemon, record) = start_daemon(temp_dir.path());

    let body: StatusResponse = reqwest::blocking::Client::new()
        .post(url(&record, ROUTE_STOP))
        .send()
        .expect("stop")
        .json()
        .expect("json");
    assert_eq!(body, StatusResponse::stopping());

    let status = daemon.wait(Duration::from_secs(10));
    assert!(status.success());
    assert!(!temp_dir.path().join(STATE_FILE_NAME).exists());
    assert!(!temp_dir.path().join(LOCK_FILE_NAME).exists());
}

#[test]
fn sigterm_racing_http_stop_shuts_down_once() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let (daemon, record) = start_daemon(temp_dir.path());

    // SAFETY: signalling a child this test spawned.
    let rc = unsafe { libc::kill(record.pid as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);
    // The server may already be draining; either answer is fine.
    let _ = reqwest::blocking::Client::new()
        .post(url(&record, ROUTE_STOP))
        .timeout(Duration::from_secs(2))
        .send();

    let status = daemon.wait(Duration::from_secs(10));
    assert!(status.success());
    assert!(!temp_dir.path().join(STATE_FILE_NAME).exists());
    assert!(!temp_dir.path().join(LOCK_FILE_NAME).exists());

    let log_dir = temp_dir.path().join("logs");
    let log = fs_err::read_dir(&log_dir)
        .expect("logs dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| fs_err::read_to_string(entry.path()).unwrap_or_default())
        .collect::<String>();
    assert_eq!(log.matches("Daemon shutting down").count(), 1);
    assert_eq!(log.matches("Daemon stopped").count(), 1);
}
