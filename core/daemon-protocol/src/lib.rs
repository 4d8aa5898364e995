//! Wire types for relay-daemon.
//!
//! This crate is shared by the daemon, the `relay` CLI, and session runners so
//! the state file layout and control-server payloads cannot drift apart. The
//! daemon remains the authority on validation; clients reuse the same types to
//! build requests and decode responses.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod machine;

/// Control server only ever binds here.
pub const CONTROL_HOST: &str = "127.0.0.1";
pub const STATE_FILE_NAME: &str = "daemon.state.json";
pub const LOCK_FILE_NAME: &str = "daemon.state.json.lock";
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const ACTION_CREATE_DIRECTORY: &str = "CREATE_DIRECTORY";

pub const ROUTE_SESSION_STARTED: &str = "/session-started";
pub const ROUTE_LIST: &str = "/list";
pub const ROUTE_STOP_SESSION: &str = "/stop-session";
pub const ROUTE_SPAWN_SESSION: &str = "/spawn-session";
pub const ROUTE_STOP: &str = "/stop";

/// Prefix used for sessions that have not reported a remote id yet.
pub const PID_SESSION_PREFIX: &str = "PID-";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State file
// ─────────────────────────────────────────────────────────────────────────────

/// Contents of `daemon.state.json`.
///
/// Best-effort liveness record; the lock file decides ownership.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStateRecord {
    pub pid: u32,
    pub http_port: u16,
    pub start_time: String,
    pub started_with_cli_version: String,
    pub started_with_cli_mtime_ms: i64,
    pub last_heartbeat: String,
    pub daemon_log_path: String,
}

impl DaemonStateRecord {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.pid == 0 {
            return Err(ErrorInfo::new("invalid-pid", "pid must be non-zero"));
        }
        if self.http_port == 0 {
            return Err(ErrorInfo::new("invalid-port", "httpPort must be non-zero"));
        }
        for (field, value) in [
            ("startTime", &self.start_time),
            ("lastHeartbeat", &self.last_heartbeat),
        ] {
            if DateTime::parse_from_rfc3339(value).is_err() {
                return Err(ErrorInfo::new(
                    "invalid-timestamp",
                    format!("{} must be RFC3339", field),
                ));
            }
        }
        Ok(())
    }

    pub fn control_url(&self, route: &str) -> String {
        format!("http://{}:{}{}", CONTROL_HOST, self.http_port, route)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control server payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StartedBy {
    Daemon,
    Terminal,
}

impl StartedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartedBy::Daemon => "daemon",
            StartedBy::Terminal => "terminal",
        }
    }
}

impl std::str::FromStr for StartedBy {
    type Err = ErrorInfo;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "daemon" => Ok(StartedBy::Daemon),
            "terminal" => Ok(StartedBy::Terminal),
            other => Err(ErrorInfo::new(
                "invalid-started-by",
                format!("unknown startedBy value: {}", other),
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub host_pid: u32,
    #[serde(default)]
    pub started_by: Option<StartedBy>,
    #[serde(default)]
    pub path: Option<String>,
    /// Anything else the session runner reports, kept for diagnostics.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartedRequest {
    pub session_id: String,
    pub metadata: SessionMetadata,
}

impl SessionStartedRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_session_id(&self.session_id)?;
        if self.metadata.host_pid == 0 {
            return Err(ErrorInfo::new("invalid-pid", "metadata.hostPid is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn stopping() -> Self {
        Self {
            status: "stopping".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChildSummary {
    pub started_by: StartedBy,
    #[serde(default)]
    pub happy_session_id: Option<String>,
    pub pid: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ListResponse {
    pub children: Vec<ChildSummary>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionRequest {
    pub session_id: String,
}

impl StopSessionRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_session_id(&self.session_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StopSessionResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionRequest {
    pub directory: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub approved_new_directory_creation: bool,
}

impl SpawnSessionRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.directory.trim().is_empty() {
            return Err(ErrorInfo::new("missing-field", "directory is required"));
        }
        Ok(())
    }
}

/// Response body for `/spawn-session` and the `spawn-happy-session` RPC.
///
/// Exactly one of three shapes is produced: started, approval required, or
/// failed. Use the constructors rather than filling fields by hand.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_new_directory_creation: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_user_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_required: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Borrowed view used by callers to branch on a spawn response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome<'a> {
    Started {
        session_id: &'a str,
        created_directory: bool,
    },
    ApprovalRequired {
        directory: &'a str,
    },
    Failed {
        error: &'a str,
        reason: Option<&'a str>,
    },
}

impl SpawnSessionResponse {
    pub fn started(session_id: impl Into<String>, created_directory: bool) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.into()),
            approved_new_directory_creation: Some(created_directory),
            requires_user_approval: false,
            action_required: None,
            directory: None,
            error: None,
            reason: None,
        }
    }

    pub fn approval_required(directory: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            approved_new_directory_creation: None,
            requires_user_approval: true,
            action_required: Some(ACTION_CREATE_DIRECTORY.to_string()),
            directory: Some(directory.into()),
            error: None,
            reason: None,
        }
    }

    pub fn failed(reason: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            approved_new_directory_creation: None,
            requires_user_approval: false,
            action_required: None,
            directory: None,
            error: Some(error.into()),
            reason: Some(reason.to_string()),
        }
    }

    pub fn outcome(&self) -> SpawnOutcome<'_> {
        if self.success {
            return SpawnOutcome::Started {
                session_id: self.session_id.as_deref().unwrap_or_default(),
                created_directory: self.approved_new_directory_creation.unwrap_or(false),
            };
        }
        if self.requires_user_approval {
            return SpawnOutcome::ApprovalRequired {
                directory: self.directory.as_deref().unwrap_or_default(),
            };
        }
        SpawnOutcome::Failed {
            error: self.error.as_deref().unwrap_or("unknown error"),
            reason: self.reason.as_deref(),
        }
    }
}

/// Error envelope for any control route that fails before producing its own
/// response shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ControlErrorBody {
    pub success: bool,
    pub reason: String,
    pub error: String,
}

fn require_session_id(value: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new("missing-field", "sessionId is required"));
    }
    if value.len() > 256 {
        return Err(ErrorInfo::new(
            "invalid-session-id",
            "sessionId must be 256 characters or fewer",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DaemonStateRecord {
        DaemonStateRecord {
            pid: 100,
            http_port: 4242,
            start_time: "2026-01-30T12:00:00Z".to_string(),
            started_with_cli_version: "0.2.0".to_string(),
            started_with_cli_mtime_ms: 1_700_000_000_000,
            last_heartbeat: "2026-01-30T12:01:00Z".to_string(),
            daemon_log_path: "/tmp/relay/logs/daemon.log".to_string(),
        }
    }

    #[test]
    fn state_record_uses_camel_case_keys() {
        let value = serde_json::to_value(record()).expect("serialize");
        assert_eq!(value["httpPort"], 4242);
        assert_eq!(value["startedWithCliMtimeMs"], 1_700_000_000_000i64);
        assert_eq!(value["daemonLogPath"], "/tmp/relay/logs/daemon.log");
    }

    #[test]
    fn state_record_rejects_bad_timestamp() {
        let mut state = record();
        state.last_heartbeat = "yesterday".to_string();
        assert_eq!(
            state.validate().expect_err("invalid").code,
            "invalid-timestamp"
        );
    }

    #[test]
    fn validation_codes_are_kebab_case() {
        let mut bad_state = record();
        bad_state.pid = 0;
        let codes = [
            bad_state.validate().expect_err("pid").code,
            require_session_id("").expect_err("empty").code,
            require_session_id(&"x".repeat(300)).expect_err("long").code,
            "robot".parse::<StartedBy>().expect_err("started by").code,
            SpawnSessionRequest {
                directory: " ".to_string(),
                session_id: None,
                approved_new_directory_creation: false,
            }
            .validate()
            .expect_err("directory")
            .code,
        ];
        for code in codes {
            assert!(
                code.chars().all(|c| c.is_ascii_lowercase() || c == '-'),
                "{} is not kebab-case",
                code
            );
        }
    }

    #[test]
    fn session_started_requires_host_pid() {
        let request: SessionStartedRequest = serde_json::from_value(serde_json::json!({
            "sessionId": "abc",
            "metadata": { "hostPid": 0, "path": "/repo" }
        }))
        .expect("parse");
        assert_eq!(request.validate().expect_err("invalid").code, "invalid-pid");
    }

    #[test]
    fn session_metadata_keeps_unknown_fields() {
        let request: SessionStartedRequest = serde_json::from_value(serde_json::json!({
            "sessionId": "abc",
            "metadata": { "hostPid": 12, "startedBy": "daemon", "flavor": "claude" }
        }))
        .expect("parse");
        assert!(request.validate().is_ok());
        assert_eq!(request.metadata.started_by, Some(StartedBy::Daemon));
        assert_eq!(request.metadata.extra["flavor"], "claude");
    }

    #[test]
    fn approval_required_shape() {
        let value = serde_json::to_value(SpawnSessionResponse::approval_required(
            "/tmp/does-not-exist",
        ))
        .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "success": false,
                "requiresUserApproval": true,
                "actionRequired": "CREATE_DIRECTORY",
                "directory": "/tmp/does-not-exist"
            })
        );
    }

    #[test]
    fn started_shape_round_trips_to_outcome() {
        let response = SpawnSessionResponse::started("session-9", true);
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["sessionId"], "session-9");
        assert_eq!(value["approvedNewDirectoryCreation"], true);
        assert!(value.get("requiresUserApproval").is_none());

        let decoded: SpawnSessionResponse = serde_json::from_value(value).expect("parse");
        assert_eq!(
            decoded.outcome(),
            SpawnOutcome::Started {
                session_id: "session-9",
                created_directory: true
            }
        );
    }

    #[test]
    fn spawn_request_defaults_approval_to_false() {
        let request: SpawnSessionRequest =
            serde_json::from_value(serde_json::json!({ "directory": "/repo" })).expect("parse");
        assert!(!request.approved_new_directory_creation);
        assert!(request.session_id.is_none());
    }

    #[test]
    fn started_by_parses_known_values_only() {
        assert_eq!("daemon".parse::<StartedBy>(), Ok(StartedBy::Daemon));
        assert!("cron".parse::<StartedBy>().is_err());
    }
}
