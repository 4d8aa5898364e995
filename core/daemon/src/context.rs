//! Shared daemon state, built once at startup and passed to every surface.
//!
//! The control server, the machine channel RPC dispatcher, and the heartbeat
//! all hold an `Arc<DaemonContext>`. Request handling lives here so the HTTP
//! and RPC paths cannot diverge.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use relay_daemon_protocol::machine::{
    StopDaemonResult, RPC_SPAWN_SESSION, RPC_STOP_DAEMON, RPC_STOP_SESSION,
};
use relay_daemon_protocol::{
    DaemonStateRecord, ErrorInfo, ListResponse, SessionStartedRequest, SpawnSessionRequest,
    SpawnSessionResponse, StatusResponse, StopSessionRequest, StopSessionResponse,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::machine::RpcHandler;
use crate::process::{binary_mtime_ms, escalate_after, is_pid_alive, request_termination};
use crate::registry::ProcessRegistry;
use crate::shutdown::{ShutdownHandle, ShutdownSource};
use crate::spawn::{launch_session, prepare_directory, DirectoryStage};
use crate::state_file::StateStore;

/// What this daemon instance was started as. Compared against the installed
/// binary on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupStamp {
    pub pid: u32,
    pub version: String,
    pub binary_mtime_ms: Option<i64>,
    pub start_time: DateTime<Utc>,
}

impl StartupStamp {
    pub fn capture(config: &DaemonConfig) -> Self {
        Self {
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            binary_mtime_ms: binary_mtime_ms(&config.binary_path),
            start_time: Utc::now(),
        }
    }
}

pub struct DaemonContext {
    pub config: DaemonConfig,
    pub registry: Arc<ProcessRegistry>,
    pub state_store: StateStore,
    pub shutdown: ShutdownHandle,
    pub stamp: StartupStamp,
    pub http_port: u16,
    pub log_path: Option<PathBuf>,
}

impl DaemonContext {
    pub fn state_record(&self, last_heartbeat: DateTime<Utc>) -> DaemonStateRecord {
        DaemonStateRecord {
            pid: self.stamp.pid,
            http_port: self.http_port,
            start_time: self.stamp.start_time.to_rfc3339(),
            started_with_cli_version: self.stamp.version.clone(),
            started_with_cli_mtime_ms: self.stamp.binary_mtime_ms.unwrap_or_default(),
            last_heartbeat: last_heartbeat.to_rfc3339(),
            daemon_log_path: self
                .log_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
        }
    }

    /// Writes the state file with `lastHeartbeat` set to now.
    pub fn write_state(&self) -> Result<()> {
        self.state_store.write(&self.state_record(Utc::now()))
    }

    pub fn session_started(
        &self,
        request: &SessionStartedRequest,
    ) -> std::result::Result<StatusResponse, ErrorInfo> {
        request.validate()?;
        self.registry.on_session_webhook(request);
        Ok(StatusResponse::ok())
    }

    pub fn list_children(&self) -> ListResponse {
        ListResponse {
            children: self
                .registry
                .list()
                .iter()
                .map(|session| session.summary())
                .collect(),
        }
    }

    /// SIGTERM now; SIGKILL after the stop grace if the process lingers.
    pub fn stop_session(
        &self,
        request: &StopSessionRequest,
    ) -> std::result::Result<StopSessionResponse, ErrorInfo> {
        request.validate()?;
        let Some(pid) = self.registry.resolve(&request.session_id) else {
            info!(session_id = %request.session_id, "Stop requested for unknown session");
            return Ok(StopSessionResponse { success: false });
        };

        if let Err(err) = request_termination(pid) {
            if is_pid_alive(pid) {
                warn!(pid, error = %err, "Failed to signal session process");
                return Ok(StopSessionResponse { success: false });
            }
        }
        self.registry.remove_by_pid(pid);

        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            escalate_after(pid, grace).await;
        });

        info!(session_id = %request.session_id, pid, "Stopping session");
        Ok(StopSessionResponse { success: true })
    }

    pub async fn spawn_session(
        &self,
        request: &SpawnSessionRequest,
    ) -> std::result::Result<SpawnSessionResponse, ErrorInfo> {
        request.validate()?;

        let stage =
            match prepare_directory(&request.directory, request.approved_new_directory_creation)
                .await
            {
                Ok(stage) => stage,
                Err(failure) => {
                    warn!(
                        directory = %request.directory,
                        reason = failure.reason,
                        "Spawn rejected"
                    );
                    return Ok(failure.into_response());
                }
            };

        if stage == DirectoryStage::PendingApproval {
            return Ok(SpawnSessionResponse::approval_required(
                request.directory.clone(),
            ));
        }

        match launch_session(
            &self.registry,
            &self.config.session,
            request,
            self.http_port,
            self.config.webhook_timeout,
        )
        .await
        {
            Ok(session_id) => Ok(SpawnSessionResponse::started(
                session_id,
                stage == DirectoryStage::Created,
            )),
            Err(failure) => Ok(failure.into_response()),
        }
    }

    pub fn request_stop(&self, source: ShutdownSource) -> StatusResponse {
        self.shutdown.request(source, None);
        StatusResponse::stopping()
    }
}

/// Routes machine-channel RPCs to the same handlers as the control server.
pub struct RpcDispatcher {
    ctx: Arc<DaemonContext>,
}

impl RpcDispatcher {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }

    async fn dispatch(ctx: Arc<DaemonContext>, method: String, params: Value) -> Value {
        match method.as_str() {
            RPC_SPAWN_SESSION => {
                let response = match serde_json::from_value::<SpawnSessionRequest>(params) {
                    Ok(request) => ctx
                        .spawn_session(&request)
                        .await
                        .unwrap_or_else(|err| SpawnSessionResponse::failed(&err.code, err.message)),
                    Err(err) => SpawnSessionResponse::failed("invalid-request", err.to_string()),
                };
                to_value(&response)
            }
            RPC_STOP_SESSION => {
                let response = serde_json::from_value::<StopSessionRequest>(params)
                    .map_err(|err| ErrorInfo::new("invalid-request", err.to_string()))
                    .and_then(|request| ctx.stop_session(&request));
                match response {
                    Ok(response) => to_value(&response),
                    Err(err) => to_value(&err),
                }
            }
            RPC_STOP_DAEMON => {
                ctx.request_stop(ShutdownSource::RemoteRpc);
                to_value(&StopDaemonResult {
                    message: "Daemon stop request acknowledged, starting shutdown sequence"
                        .to_string(),
                })
            }
            other => {
                warn!(method = other, "Unknown RPC method");
                to_value(&ErrorInfo::new(
                    "unknown-method",
                    format!("unknown RPC method: {}", other),
                ))
            }
        }
    }
}

impl RpcHandler for RpcDispatcher {
    fn handle(&self, method: &str, params: Value) -> BoxFuture<'static, Value> {
        Box::pin(Self::dispatch(
            Arc::clone(&self.ctx),
            method.to_string(),
            params,
        ))
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
