//! Loopback HTTP control server.
//!
//! Local clients (the `relay` CLI and session runners) drive the daemon
//! through five POST routes. The listener only ever binds `127.0.0.1`; the
//! port is dynamic unless configured and is published through the state file.
//!
//! Every failure, whatever the route, is rendered through `ControlError`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use relay_daemon_protocol::{
    ControlErrorBody, ErrorInfo, ListResponse, SessionStartedRequest, SpawnOutcome,
    SpawnSessionRequest, StatusResponse, StopSessionRequest, StopSessionResponse, CONTROL_HOST,
    MAX_REQUEST_BYTES, ROUTE_LIST, ROUTE_SESSION_STARTED, ROUTE_SPAWN_SESSION, ROUTE_STOP,
    ROUTE_STOP_SESSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::error::{DaemonError, Result};
use crate::shutdown::{ShutdownHandle, ShutdownSource};

/// Error envelope shared by every route.
#[derive(Debug, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ControlError {
    status: StatusCode,
    reason: String,
    message: String,
}

impl ControlError {
    pub fn new(status: StatusCode, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

impl From<ErrorInfo> for ControlError {
    fn from(info: ErrorInfo) -> Self {
        Self::new(StatusCode::BAD_REQUEST, info.code, info.message)
    }
}

impl From<JsonRejection> for ControlError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid-request", rejection.body_text())
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        debug!(status = %self.status, reason = %self.reason, "Control request failed");
        let body = ControlErrorBody {
            success: false,
            reason: self.reason,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type Ctx = State<Arc<DaemonContext>>;

/// Binds the loopback listener. Returns it with the port actually bound,
/// which differs from `port` when `port` is 0.
pub async fn bind_listener(port: u16) -> Result<(TcpListener, u16)> {
    let addr = format!("{}:{}", CONTROL_HOST, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let bound = listener
        .local_addr()
        .map_err(|source| DaemonError::Bind { addr, source })?
        .port();
    Ok((listener, bound))
}

pub fn router(ctx: Arc<DaemonContext>) -> Router {
    Router::new()
        .route(ROUTE_SESSION_STARTED, post(session_started))
        .route(ROUTE_LIST, post(list))
        .route(ROUTE_STOP_SESSION, post(stop_session))
        .route(ROUTE_SPAWN_SESSION, post(spawn_session))
        .route(ROUTE_STOP, post(stop))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(ctx)
}

async fn session_started(
    State(ctx): Ctx,
    payload: std::result::Result<Json<SessionStartedRequest>, JsonRejection>,
) -> std::result::Result<Json<StatusResponse>, ControlError> {
    let Json(request) = payload?;
    Ok(Json(ctx.session_started(&request)?))
}

async fn list(State(ctx): Ctx) -> Json<ListResponse> {
    Json(ctx.list_children())
}

async fn stop_session(
    State(ctx): Ctx,
    payload: std::result::Result<Json<StopSessionRequest>, JsonRejection>,
) -> std::result::Result<Json<StopSessionResponse>, ControlError> {
    let Json(request) = payload?;
    Ok(Json(ctx.stop_session(&request)?))
}

async fn spawn_session(
    State(ctx): Ctx,
    payload: std::result::Result<Json<SpawnSessionRequest>, JsonRejection>,
) -> std::result::Result<Response, ControlError> {
    let Json(request) = payload?;
    let response = ctx.spawn_session(&request).await?;
    let status = match response.outcome() {
        SpawnOutcome::Started { .. } => StatusCode::OK,
        SpawnOutcome::ApprovalRequired { .. } => StatusCode::CONFLICT,
        SpawnOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Ok((status, Json(response)).into_response())
}

async fn stop(State(ctx): Ctx) -> Json<StatusResponse> {
    info!("Stop requested over HTTP");
    Json(ctx.request_stop(ShutdownSource::HttpStop))
}

/// A running control server.
pub struct ControlServer {
    port: u16,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Serves `router` on an already-bound listener.
    ///
    /// If the server dies on its own, the daemon is shut down as a fault.
    pub fn serve(listener: TcpListener, port: u16, router: Router, shutdown: ShutdownHandle) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                    debug!("Control server received stop");
                })
                .await;
            if let Err(err) = served {
                error!(error = %err, "Control server failed");
                shutdown.request(ShutdownSource::Fault, Some(format!("control server: {}", err)));
            }
        });

        info!(port, host = CONTROL_HOST, "Control server listening");
        Self {
            port,
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops accepting connections and waits up to `timeout` for in-flight
    /// requests.
    pub async fn stop(mut self, timeout: Duration) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => info!(port = self.port, "Control server stopped"),
            Err(_) => {
                warn!(port = self.port, "Control server did not drain in time");
                self.task.abort();
            }
        }
    }
}
