//! Machine channel frames and the versioned-update contract.
//!
//! Metadata and daemon state are versioned independently so that frequent
//! status updates never contend with rare metadata edits. Every write carries
//! the version the writer last observed; a stale write is rejected with the
//! authoritative version and value, and nothing changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_MACHINE_ALIVE: &str = "machine-alive";
pub const EVENT_UPDATE_STATE: &str = "machine-update-state";
pub const EVENT_UPDATE_METADATA: &str = "machine-update-metadata";

pub const RPC_SPAWN_SESSION: &str = "spawn-happy-session";
pub const RPC_STOP_SESSION: &str = "stop-session";
pub const RPC_STOP_DAEMON: &str = "stop-daemon";

pub const RPC_METHODS: [&str; 3] = [RPC_SPAWN_SESSION, RPC_STOP_SESSION, RPC_STOP_DAEMON];

/// RPC names are scoped by machine id so a shared coordinator can route them.
pub fn scoped_method(machine_id: &str, method: &str) -> String {
    format!("{}:{}", machine_id, method)
}

/// Returns the bare method name when `scoped` targets `machine_id`.
pub fn unscope_method<'a>(machine_id: &str, scoped: &'a str) -> Option<&'a str> {
    let (target, method) = scoped.split_once(':')?;
    (target == machine_id).then_some(method)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineMetadata {
    pub host: String,
    pub platform: String,
    pub cli_version: String,
    pub home_dir: String,
    pub relay_home_dir: String,
    pub relay_lib_dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonStatus {
    Running,
    ShuttingDown,
    Offline,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDaemonState {
    pub status: DaemonStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_requested_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateResult {
    Success,
    VersionMismatch,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAlive {
    pub machine_id: String,
    /// Unix epoch milliseconds.
    pub time: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStateRequest {
    pub machine_id: String,
    pub daemon_state: RemoteDaemonState,
    pub expected_version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdateAck {
    pub result: UpdateResult,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub daemon_state: Option<RemoteDaemonState>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataRequest {
    pub machine_id: String,
    pub metadata: MachineMetadata,
    pub expected_version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdateAck {
    pub result: UpdateResult,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub metadata: Option<MachineMetadata>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StopDaemonResult {
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration (HTTP)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMachineRequest {
    pub id: String,
    pub metadata: MachineMetadata,
    pub daemon_state: RemoteDaemonState,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub id: String,
    pub metadata: MachineMetadata,
    pub metadata_version: u64,
    #[serde(default)]
    pub daemon_state: Option<RemoteDaemonState>,
    pub daemon_state_version: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegisterMachineResponse {
    pub machine: MachineRecord,
}

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

/// One JSON object per WebSocket text frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Fire-and-forget event.
    Emit { event: String, data: Value },
    /// Event that expects an `Ack` with the same id.
    Request { id: u64, event: String, data: Value },
    Ack { id: u64, data: Value },
    RpcRegister { method: String },
    RpcRequest {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    RpcResponse { id: String, result: Value },
}

impl Frame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Versioned values
// ─────────────────────────────────────────────────────────────────────────────

/// A value guarded by optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    version: u64,
    value: T,
}

/// Rejected proposal: the authoritative version and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMismatch<T> {
    pub version: u64,
    pub current: T,
}

impl<T: Clone> Versioned<T> {
    pub fn new(version: u64, value: T) -> Self {
        Self { version, value }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Applies `value` only if `expected` is the current version.
    pub fn propose(&mut self, expected: u64, value: T) -> Result<u64, VersionMismatch<T>> {
        if expected != self.version {
            return Err(VersionMismatch {
                version: self.version,
                current: self.value.clone(),
            });
        }
        self.version += 1;
        self.value = value;
        Ok(self.version)
    }
}
