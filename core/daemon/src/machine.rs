//! Persistent WebSocket link to the coordinator.
//!
//! # Connection
//!
//! The channel connects to `<server>/v1/updates?clientType=machine-scoped&machineId=<id>`
//! with a bearer token and reconnects forever with exponential backoff
//! (1s doubling to 30s) until `close` is called. The delay only drops back
//! to 1s after a connection stayed up for `STABLE_CONNECTION`, so a
//! coordinator that accepts and immediately drops still sees growing gaps.
//! On every connect it registers the machine-scoped RPC methods.
//!
//! # Traffic
//!
//! - `emit`: fire-and-forget. Dropped while disconnected.
//! - `request`/`ack`: versioned updates. Fail fast while disconnected and
//!   fail with `Disconnected` if the link drops before the ack arrives.
//! - `rpc-request`/`rpc-response`: inbound calls, each handled on its own task.
//!
//! Version-mismatch acks are returned to the caller as-is; this module never
//! retries a proposal.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use relay_daemon_protocol::machine::{
    scoped_method, unscope_method, Frame, MachineAlive, MachineMetadata, MetadataUpdateAck,
    RemoteDaemonState, StateUpdateAck, UpdateMetadataRequest, UpdateStateRequest,
    EVENT_MACHINE_ALIVE, EVENT_UPDATE_METADATA, EVENT_UPDATE_STATE, RPC_METHODS,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::process::now_ms;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Machine channel is not connected")]
    NotConnected,

    #[error("Machine channel disconnected before {event} was acknowledged")]
    Disconnected { event: String },

    #[error("Machine channel is closed")]
    Closed,

    #[error("Timed out waiting for {event} acknowledgement")]
    Timeout { event: String },

    #[error("Coordinator rejected {event}")]
    Rejected { event: String },

    #[error("{event} still conflicted after {attempts} attempts")]
    VersionConflict { event: String, attempts: usize },

    #[error("Malformed acknowledgement for {event}: {source}")]
    InvalidAck {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid coordinator URL {url}: {details}")]
    InvalidUrl { url: String, details: String },

    #[error("Access token is not a valid header value")]
    InvalidToken,
}

/// Handles inbound RPCs after the machine-id scope has been stripped.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, method: &str, params: Value) -> BoxFuture<'static, Value>;
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub server_url: Url,
    pub token: String,
    pub machine_id: String,
    pub beacon_interval: Duration,
    pub request_timeout: Duration,
}

/// Last versions the coordinator confirmed for this machine.
#[derive(Debug, Default)]
pub struct RemoteVersions {
    metadata: AtomicU64,
    daemon_state: AtomicU64,
}

impl RemoteVersions {
    pub fn new(metadata: u64, daemon_state: u64) -> Self {
        Self {
            metadata: AtomicU64::new(metadata),
            daemon_state: AtomicU64::new(daemon_state),
        }
    }

    pub fn metadata(&self) -> &AtomicU64 {
        &self.metadata
    }

    pub fn daemon_state(&self) -> &AtomicU64 {
        &self.daemon_state
    }
}

enum Outbound {
    Frame(Frame),
    Close,
}

struct ChannelShared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    connected: watch::Sender<bool>,
}

impl ChannelShared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
        if !connected {
            // Dropping the senders wakes every waiter with `Disconnected`.
            self.pending().clear();
        }
    }
}

pub struct MachineChannel {
    machine_id: String,
    request_timeout: Duration,
    shared: Arc<ChannelShared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MachineChannel {
    /// Starts the connection loop in the background. Returns immediately.
    pub fn start(config: ChannelConfig, handler: Arc<dyn RpcHandler>) -> Result<Self, ChannelError> {
        let url = updates_url(&config.server_url, &config.machine_id)?;
        // Validate once so the loop never fails on a bad token.
        build_request(&url, &config.token)?;

        let (connected, _) = watch::channel(false);
        let shared = Arc::new(ChannelShared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            connected,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let connection = Connection {
            url,
            token: config.token.clone(),
            machine_id: config.machine_id.clone(),
            beacon_interval: config.beacon_interval,
            shared: Arc::clone(&shared),
            handler,
            outbound: outbound.clone(),
        };
        let task = tokio::spawn(connection.run(outbound_rx, stop_rx));

        Ok(Self {
            machine_id: config.machine_id,
            request_timeout: config.request_timeout,
            shared,
            outbound,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Watches the connection flag; flips on every connect and disconnect.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Fire-and-forget. Silently dropped while disconnected.
    pub fn emit(&self, event: &str, data: Value) {
        queue_emit(&self.shared, &self.outbound, event, data);
    }

    pub async fn update_daemon_state(
        &self,
        state: &RemoteDaemonState,
        expected_version: u64,
    ) -> Result<StateUpdateAck, ChannelError> {
        let data = serde_json::to_value(UpdateStateRequest {
            machine_id: self.machine_id.clone(),
            daemon_state: state.clone(),
            expected_version,
        })?;
        let ack = self.request(EVENT_UPDATE_STATE, data).await?;
        serde_json::from_value(ack).map_err(|source| ChannelError::InvalidAck {
            event: EVENT_UPDATE_STATE.to_string(),
            source,
        })
    }

    pub async fn update_metadata(
        &self,
        metadata: &MachineMetadata,
        expected_version: u64,
    ) -> Result<MetadataUpdateAck, ChannelError> {
        let data = serde_json::to_value(UpdateMetadataRequest {
            machine_id: self.machine_id.clone(),
            metadata: metadata.clone(),
            expected_version,
        })?;
        let ack = self.request(EVENT_UPDATE_METADATA, data).await?;
        serde_json::from_value(ack).map_err(|source| ChannelError::InvalidAck {
            event: EVENT_UPDATE_METADATA.to_string(),
            source,
        })
    }

    async fn request(&self, event: &str, data: Value) -> Result<Value, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        let frame = Frame::Request {
            id,
            event: event.to_string(),
            data,
        };
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.shared.pending().remove(&id);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ChannelError::Disconnected {
                event: event.to_string(),
            }),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(ChannelError::Timeout {
                    event: event.to_string(),
                })
            }
        }
    }

    /// Flushes queued frames, closes the socket, and stops reconnecting.
    pub async fn close(&self, timeout: Duration) {
        let _ = self.outbound.send(Outbound::Close);
        self.stop_tx.send_replace(true);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return;
        };
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("Machine channel did not close in time");
            task.abort();
        }
        info!("Machine channel closed");
    }
}

/// Background half of the channel: owns the socket.
struct Connection {
    url: Url,
    token: String,
    machine_id: String,
    beacon_interval: Duration,
    shared: Arc<ChannelShared>,
    handler: Arc<dyn RpcHandler>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    async fn run(
        self,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let request = match build_request(&self.url, &self.token) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "Machine channel request invalid");
                    break;
                }
            };

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(request) => result,
                _ = stop_rx.changed() => break,
            };
            let ws = match connected {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Machine channel connect failed"
                    );
                    if !wait_or_stop(backoff, &mut stop_rx).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                    continue;
                }
            };

            let (mut sink, mut stream) = ws.split();
            let mut registered = true;
            for method in RPC_METHODS {
                let frame = Frame::RpcRegister {
                    method: scoped_method(&self.machine_id, method),
                };
                if send_frame(&mut sink, &frame).await.is_err() {
                    registered = false;
                    break;
                }
            }
            if !registered {
                warn!(
                    retry_in_ms = backoff.as_millis() as u64,
                    "Machine channel dropped during RPC registration"
                );
                let _ = sink.close().await;
                if !wait_or_stop(backoff, &mut stop_rx).await {
                    break;
                }
                backoff = next_backoff(backoff);
                continue;
            }

            info!(machine_id = %self.machine_id, "Machine channel connected");
            self.shared.set_connected(true);
            let connected_at = Instant::now();

            let mut beacon = tokio::time::interval(self.beacon_interval);
            beacon.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let closing = loop {
                tokio::select! {
                    biased;
                    inbound = stream.next() => match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text),
                        Some(Ok(Message::Close(_))) | None => break false,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "Machine channel read failed");
                            break false;
                        }
                    },
                    Some(outbound) = outbound_rx.recv() => match outbound {
                        Outbound::Frame(frame) => {
                            if send_frame(&mut sink, &frame).await.is_err() {
                                break false;
                            }
                        }
                        Outbound::Close => {
                            let _ = sink.close().await;
                            break true;
                        }
                    },
                    _ = beacon.tick() => {
                        let alive = serde_json::to_value(MachineAlive {
                            machine_id: self.machine_id.clone(),
                            time: now_ms(),
                        })
                        .unwrap_or(Value::Null);
                        queue_emit(&self.shared, &self.outbound, EVENT_MACHINE_ALIVE, alive);
                    }
                    _ = stop_rx.changed() => {
                        let _ = sink.close().await;
                        break true;
                    }
                }
            };

            self.shared.set_connected(false);
            if closing {
                break;
            }
            let connected_for = connected_at.elapsed();
            backoff = backoff_after_disconnect(backoff, connected_for);
            warn!(
                connected_for_ms = connected_for.as_millis() as u64,
                retry_in_ms = backoff.as_millis() as u64,
                "Machine channel disconnected"
            );
            if !wait_or_stop(backoff, &mut stop_rx).await {
                break;
            }
            backoff = next_backoff(backoff);
        }
        self.shared.set_connected(false);
        debug!("Machine channel loop exited");
    }

    fn handle_inbound(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "Ignoring undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Ack { id, data } => match self.shared.pending().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(data);
                }
                None => debug!(id, "Ack without a waiter"),
            },
            Frame::RpcRequest { id, method, params } => {
                let outbound = self.outbound.clone();
                let Some(local) = unscope_method(&self.machine_id, &method) else {
                    warn!(method = %method, "RPC for another machine");
                    let result = serde_json::json!({ "error": format!("unknown method: {}", method) });
                    let _ = outbound.send(Outbound::Frame(Frame::RpcResponse { id, result }));
                    return;
                };
                debug!(method = local, "Dispatching RPC");
                let pending = self.handler.handle(local, params);
                tokio::spawn(async move {
                    let result = pending.await;
                    let _ = outbound.send(Outbound::Frame(Frame::RpcResponse { id, result }));
                });
            }
            Frame::Emit { event, .. } => debug!(event = %event, "Ignoring coordinator event"),
            other => debug!(frame = ?other, "Unexpected frame from coordinator"),
        }
    }
}

/// Queues an emit for the connection task, or drops it while disconnected.
fn queue_emit(
    shared: &ChannelShared,
    outbound: &mpsc::UnboundedSender<Outbound>,
    event: &str,
    data: Value,
) {
    if !*shared.connected.borrow() {
        debug!(event, "Dropping emit while disconnected");
        return;
    }
    let _ = outbound.send(Outbound::Frame(Frame::Emit {
        event: event.to_string(),
        data,
    }));
}

/// Sleeps for `delay`. Returns `false` if the channel was told to stop.
async fn wait_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop_rx.changed() => false,
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = match frame.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "Failed to encode frame");
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

/// `<server>/v1/updates` with a ws scheme and machine-scoped query.
pub fn updates_url(server_url: &Url, machine_id: &str) -> Result<Url, ChannelError> {
    let invalid = |details: &str| ChannelError::InvalidUrl {
        url: server_url.to_string(),
        details: details.to_string(),
    };

    let scheme = match server_url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(invalid("scheme must be http(s) or ws(s)")),
    };
    let mut url = server_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to websocket scheme"))?;

    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/v1/updates", base));
    url.query_pairs_mut()
        .clear()
        .append_pair("clientType", "machine-scoped")
        .append_pair("machineId", machine_id);
    Ok(url)
}

fn build_request(url: &Url, token: &str) -> Result<Request, ChannelError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| ChannelError::InvalidUrl {
            url: url.to_string(),
            details: err.to_string(),
        })?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ChannelError::InvalidToken)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(request)
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Delay before reconnecting after an established connection dropped.
fn backoff_after_disconnect(current: Duration, connected_for: Duration) -> Duration {
    if connected_for >= STABLE_CONNECTION {
        INITIAL_BACKOFF
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_url_switches_scheme_and_scopes_query() {
        let server = Url::parse("https://relay.example/api/").expect("url");
        let url = updates_url(&server, "machine-1").expect("updates url");
        assert_eq!(
            url.as_str(),
            "wss://relay.example/api/v1/updates?clientType=machine-scoped&machineId=machine-1"
        );

        let local = Url::parse("http://127.0.0.1:3005").expect("url");
        assert_eq!(
            updates_url(&local, "m").expect("updates url").as_str(),
            "ws://127.0.0.1:3005/v1/updates?clientType=machine-scoped&machineId=m"
        );
    }

    #[test]
    fn request_carries_bearer_token() {
        let url = Url::parse("ws://127.0.0.1:3005/v1/updates").expect("url");
        let request = build_request(&url, "secret").expect("request");
        assert_eq!(
            request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer secret")
        );
        assert!(matches!(
            build_request(&url, "bad\ntoken"),
            Err(ChannelError::InvalidToken)
        ));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn flapping_connection_keeps_growing_backoff() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..4 {
            delay = backoff_after_disconnect(delay, Duration::from_millis(5));
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8]);

        assert_eq!(
            backoff_after_disconnect(MAX_BACKOFF, STABLE_CONNECTION),
            INITIAL_BACKOFF
        );
    }

    #[tokio::test]
    async fn requests_fail_fast_while_disconnected() {
        struct Noop;
        impl RpcHandler for Noop {
            fn handle(&self, _method: &str, _params: Value) -> BoxFuture<'static, Value> {
                Box::pin(async { Value::Null })
            }
        }

        // Nothing listens on port 1; the loop stays in backoff.
        let channel = MachineChannel::start(
            ChannelConfig {
                server_url: Url::parse("http://127.0.0.1:1").expect("url"),
                token: "t".to_string(),
                machine_id: "m".to_string(),
                beacon_interval: Duration::from_secs(20),
                request_timeout: Duration::from_secs(1),
            },
            Arc::new(Noop),
        )
        .expect("start");

        assert!(!channel.is_connected());
        let state = RemoteDaemonState {
            status: relay_daemon_protocol::machine::DaemonStatus::Running,
            pid: Some(1),
            http_port: None,
            started_at: None,
            shutdown_requested_at: None,
            shutdown_source: None,
        };
        assert!(matches!(
            channel.update_daemon_state(&state, 0).await,
            Err(ChannelError::NotConnected)
        ));
        channel.emit(EVENT_MACHINE_ALIVE, Value::Null);
        channel.close(Duration::from_secs(1)).await;
    }
}
