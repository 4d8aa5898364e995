//! Client for the daemon's loopback control server.
//!
//! The daemon publishes its port only through the state file, so every
//! command starts by reading it. A session runner started by the daemon gets
//! the port through `RELAY_DAEMON_HTTP_PORT` instead.

use fs_err as fs;
use relay_daemon_protocol::{
    ControlErrorBody, DaemonStateRecord, ListResponse, SessionStartedRequest,
    SpawnSessionRequest, SpawnSessionResponse, StatusResponse, StopSessionRequest,
    StopSessionResponse, CONTROL_HOST, ROUTE_LIST, ROUTE_SESSION_STARTED, ROUTE_SPAWN_SESSION,
    ROUTE_STOP, ROUTE_STOP_SESSION, STATE_FILE_NAME,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CliError, Result};

pub const HOME_DIR_ENV: &str = "RELAY_HOME_DIR";
pub const DAEMON_PORT_ENV: &str = "RELAY_DAEMON_HTTP_PORT";

const DEFAULT_HOME_DIR_NAME: &str = ".relay";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
// Spawns wait for the session webhook on the daemon side.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn relay_home(env_value: Option<String>) -> Result<PathBuf> {
    match env_value.filter(|value| !value.trim().is_empty()) {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => dirs::home_dir()
            .map(|home| home.join(DEFAULT_HOME_DIR_NAME))
            .ok_or(CliError::HomeDirNotFound),
    }
}

pub fn state_path(home: &Path) -> PathBuf {
    home.join(STATE_FILE_NAME)
}

/// Reads the state file. Missing or unparseable files read as `None`.
pub fn read_state(home: &Path) -> Option<DaemonStateRecord> {
    let text = fs::read_to_string(state_path(home)).ok()?;
    match serde_json::from_str::<DaemonStateRecord>(&text) {
        Ok(record) => Some(record),
        Err(err) => {
            tracing::debug!(error = %err, "Ignoring unparseable state file");
            None
        }
    }
}

/// The state file, but only if its PID is still alive.
pub fn running_daemon(home: &Path) -> Option<DaemonStateRecord> {
    read_state(home).filter(|record| is_pid_alive(record.pid))
}

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub struct DaemonClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl DaemonClient {
    pub fn for_port(port: u16) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base: format!("http://{}:{}", CONTROL_HOST, port),
            http,
        })
    }

    pub fn from_state(home: &Path) -> Result<Self> {
        let record =
            running_daemon(home).ok_or_else(|| CliError::DaemonNotRunning(state_path(home)))?;
        Self::for_port(record.http_port)
    }

    pub fn session_started(&self, request: &SessionStartedRequest) -> Result<StatusResponse> {
        self.post(ROUTE_SESSION_STARTED, Some(request), REQUEST_TIMEOUT)
    }

    pub fn list(&self) -> Result<ListResponse> {
        self.post::<(), _>(ROUTE_LIST, None, REQUEST_TIMEOUT)
    }

    pub fn stop_session(&self, session_id: &str) -> Result<StopSessionResponse> {
        let request = StopSessionRequest {
            session_id: session_id.to_string(),
        };
        self.post(ROUTE_STOP_SESSION, Some(&request), REQUEST_TIMEOUT)
    }

    /// 409 (approval required) and 500 (spawn failed) still carry a spawn
    /// response body, so they are returned rather than treated as errors.
    pub fn spawn_session(&self, request: &SpawnSessionRequest) -> Result<SpawnSessionResponse> {
        let response = self
            .http
            .post(self.url(ROUTE_SPAWN_SESSION))
            .timeout(SPAWN_TIMEOUT)
            .json(request)
            .send()?;
        let status = response.status();
        let body = response.text()?;
        if let Ok(spawn) = serde_json::from_str::<SpawnSessionResponse>(&body) {
            if status.is_success() || spawn.requires_user_approval || spawn.reason.is_some() {
                return Ok(spawn);
            }
        }
        Err(envelope_error(status, &body))
    }

    pub fn stop(&self) -> Result<StatusResponse> {
        self.post::<(), _>(ROUTE_STOP, None, REQUEST_TIMEOUT)
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base, route)
    }

    fn post<B, T>(&self, route: &str, body: Option<&B>, timeout: Duration) -> Result<T>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(self.url(route)).timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(envelope_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|err| CliError::Daemon {
            reason: "invalid-response".to_string(),
            message: format!("{} returned unexpected body: {}", route, err),
        })
    }
}

fn envelope_error(status: reqwest::StatusCode, body: &str) -> CliError {
    match serde_json::from_str::<ControlErrorBody>(body) {
        Ok(envelope) => CliError::Daemon {
            reason: envelope.reason,
            message: envelope.error,
        },
        Err(_) => CliError::Daemon {
            reason: format!("http-{}", status.as_u16()),
            message: body.chars().take(200).collect(),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Answers one HTTP request with `status` and `body`; returns the raw
    /// request text from the join handle.
    pub(crate) fn serve_once(status: &str, body: &str) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind((CONTROL_HOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = stream.read(&mut chunk).expect("read");
                if n == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
                if request_complete(&buffer) {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).expect("write");
            String::from_utf8_lossy(&buffer).to_string()
        });
        (port, handle)
    }

    fn request_complete(buffer: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buffer);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        buffer.len() >= header_end + 4 + content_length
    }

    #[test]
    fn relay_home_prefers_env() {
        assert_eq!(
            relay_home(Some("/tmp/relay-x".to_string())).expect("home"),
            PathBuf::from("/tmp/relay-x")
        );
        let default = relay_home(Some("  ".to_string())).expect("home");
        assert!(default.ends_with(".relay"));
    }

    #[test]
    fn dead_daemon_state_is_not_running() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        assert!(read_state(temp_dir.path()).is_none());

        let record = DaemonStateRecord {
            pid: 4_000_000,
            http_port: 1234,
            start_time: "2026-01-01T00:00:00Z".to_string(),
            started_with_cli_version: "0.0.0".to_string(),
            started_with_cli_mtime_ms: 0,
            last_heartbeat: "2026-01-01T00:00:00Z".to_string(),
            daemon_log_path: String::new(),
        };
        fs::write(
            state_path(temp_dir.path()),
            serde_json::to_string(&record).expect("json"),
        )
        .expect("write state");
        assert_eq!(read_state(temp_dir.path()), Some(record));
        assert!(running_daemon(temp_dir.path()).is_none());
        assert!(matches!(
            DaemonClient::from_state(temp_dir.path()),
            Err(CliError::DaemonNotRunning(_))
        ));
    }

    #[test]
    fn list_posts_to_list_route() {
        let (port, server) = serve_once(
            "200 OK",
            r#"{"children":[{"startedBy":"daemon","happySessionId":"s-1","pid":42}]}"#,
        );
        let list = DaemonClient::for_port(port).expect("client").list().expect("list");
        assert_eq!(list.children.len(), 1);
        assert_eq!(list.children[0].pid, 42);
        let request = server.join().expect("join");
        assert!(request.starts_with("POST /list "));
    }

    #[test]
    fn approval_required_is_not_an_error() {
        let body = serde_json::to_string(&SpawnSessionResponse::approval_required("/tmp/new"))
            .expect("json");
        let (port, server) = serve_once("409 Conflict", &body);
        let response = DaemonClient::for_port(port)
            .expect("client")
            .spawn_session(&SpawnSessionRequest {
                directory: "/tmp/new".to_string(),
                session_id: None,
                approved_new_directory_creation: false,
            })
            .expect("spawn");
        assert!(response.requires_user_approval);
        let request = server.join().expect("join");
        assert!(request.contains("\"directory\":\"/tmp/new\""));
    }

    #[test]
    fn error_envelope_becomes_daemon_error() {
        let (port, server) = serve_once(
            "400 Bad Request",
            r#"{"success":false,"reason":"missing-field","error":"sessionId is required"}"#,
        );
        let result = DaemonClient::for_port(port)
            .expect("client")
            .stop_session("");
        match result {
            Err(CliError::Daemon { reason, message }) => {
                assert_eq!(reason, "missing-field");
                assert_eq!(message, "sessionId is required");
            }
            other => panic!("expected daemon error, got {:?}", other.map(|r| r.success)),
        }
        server.join().expect("join");
    }
}
