//! Machine channel against an in-process fake coordinator.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use relay_daemon::config::DaemonConfig;
use relay_daemon::context::{DaemonContext, RpcDispatcher, StartupStamp};
use relay_daemon::machine::{ChannelConfig, ChannelError, MachineChannel, RemoteVersions};
use relay_daemon::registry::ProcessRegistry;
use relay_daemon::shutdown::{ShutdownHandle, ShutdownSource};
use relay_daemon::state_file::StateStore;
use relay_daemon::supervisor::propose_daemon_state;
use relay_daemon_protocol::machine::{
    DaemonStatus, Frame, RemoteDaemonState, StateUpdateAck, UpdateResult, UpdateStateRequest,
    Versioned, EVENT_UPDATE_STATE,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

const MACHINE_ID: &str = "machine-test";
const TOKEN: &str = "good-token";

struct Coordinator {
    daemon_state: Mutex<Versioned<Option<RemoteDaemonState>>>,
    registered: Mutex<Vec<String>>,
    rpc_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    responses: mpsc::UnboundedSender<Frame>,
}

struct FakeServer {
    url: Url,
    coordinator: Arc<Coordinator>,
    rpc_tx: mpsc::UnboundedSender<Frame>,
    responses: mpsc::UnboundedReceiver<Frame>,
}

async fn start_coordinator(initial_version: u64) -> FakeServer {
    let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
    let (responses_tx, responses) = mpsc::unbounded_channel();
    let coordinator = Arc::new(Coordinator {
        daemon_state: Mutex::new(Versioned::new(initial_version, None)),
        registered: Mutex::new(Vec::new()),
        rpc_rx: Mutex::new(Some(rpc_rx)),
        responses: responses_tx,
    });

    let app = Router::new()
        .route("/v1/updates", get(updates))
        .with_state(Arc::clone(&coordinator));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind coordinator");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve coordinator");
    });

    FakeServer {
        url: Url::parse(&format!("http://127.0.0.1:{}", port)).expect("url"),
        coordinator,
        rpc_tx,
        responses,
    }
}

async fn updates(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(coordinator): State<Arc<Coordinator>>,
) -> Response {
    let expected = format!("Bearer {}", TOKEN);
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str());
    let scoped = query.get("clientType").map(String::as_str) == Some("machine-scoped")
        && query.get("machineId").map(String::as_str) == Some(MACHINE_ID);
    if !authorized || !scoped {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, coordinator))
}

async fn serve_socket(mut socket: WebSocket, coordinator: Arc<Coordinator>) {
    let mut rpc_rx = coordinator.rpc_rx.lock().expect("lock").take();
    loop {
        let outgoing = async {
            match rpc_rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(Message::Text(text))) = inbound else { break };
                let Ok(frame) = Frame::decode(&text) else { continue };
                if let Some(reply) = handle_frame(&coordinator, frame) {
                    let text = reply.encode().expect("encode");
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
            Some(frame) = outgoing => {
                let text = frame.encode().expect("encode");
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn handle_frame(coordinator: &Coordinator, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::RpcRegister { method } => {
            coordinator.registered.lock().expect("lock").push(method);
            None
        }
        Frame::Request { id, event, data } if event == EVENT_UPDATE_STATE => {
            let request: UpdateStateRequest = serde_json::from_value(data).expect("update");
            let mut cell = coordinator.daemon_state.lock().expect("lock");
            let ack = match cell.propose(request.expected_version, Some(request.daemon_state)) {
                Ok(version) => StateUpdateAck {
                    result: UpdateResult::Success,
                    version,
                    daemon_state: cell.value().clone(),
                },
                Err(mismatch) => StateUpdateAck {
                    result: UpdateResult::VersionMismatch,
                    version: mismatch.version,
                    daemon_state: mismatch.current,
                },
            };
            Some(Frame::Ack {
                id,
                data: serde_json::to_value(ack).expect("ack"),
            })
        }
        Frame::Request { id, .. } => Some(Frame::Ack {
            id,
            data: json!({ "result": "error" }),
        }),
        response @ Frame::RpcResponse { .. } => {
            let _ = coordinator.responses.send(response);
            None
        }
        _ => None,
    }
}

fn context(home: &Path) -> Arc<DaemonContext> {
    let config = DaemonConfig::defaults(home.to_path_buf(), home.join("relay-daemon"));
    Arc::new(DaemonContext {
        stamp: StartupStamp::capture(&config),
        state_store: StateStore::new(config.state_path()),
        config,
        registry: Arc::new(ProcessRegistry::new()),
        shutdown: ShutdownHandle::new(),
        http_port: 40124,
        log_path: None,
    })
}

fn start_channel(server_url: &Url, token: &str, ctx: &Arc<DaemonContext>) -> MachineChannel {
    MachineChannel::start(
        ChannelConfig {
            server_url: server_url.clone(),
            token: token.to_string(),
            machine_id: MACHINE_ID.to_string(),
            beacon_interval: Duration::from_secs(20),
            request_timeout: Duration::from_secs(5),
        },
        Arc::new(RpcDispatcher::new(Arc::clone(ctx))),
    )
    .expect("start channel")
}

async fn wait_connected(channel: &MachineChannel) {
    let mut state = channel.connection_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|connected| *connected))
        .await
        .expect("connect in time")
        .expect("channel alive");
}

fn running(pid: u32) -> RemoteDaemonState {
    RemoteDaemonState {
        status: DaemonStatus::Running,
        pid: Some(pid),
        http_port: Some(40124),
        started_at: Some(1),
        shutdown_requested_at: None,
        shutdown_source: None,
    }
}

#[tokio::test]
async fn stale_proposal_converges_after_retry() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let server = start_coordinator(2).await;
    let ctx = context(temp_dir.path());
    let channel = start_channel(&server.url, TOKEN, &ctx);
    wait_connected(&channel).await;

    // A single raw proposal with a stale version is rejected untouched.
    let ack = channel
        .update_daemon_state(&running(1), 1)
        .await
        .expect("ack");
    assert_eq!(ack.result, UpdateResult::VersionMismatch);
    assert_eq!(ack.version, 2);
    assert_eq!(server.coordinator.daemon_state.lock().expect("lock").version(), 2);

    // Frames are handled in order, so registration is done once an ack is back.
    let registered = server.coordinator.registered.lock().expect("lock").clone();
    assert_eq!(
        registered,
        vec![
            "machine-test:spawn-happy-session",
            "machine-test:stop-session",
            "machine-test:stop-daemon",
        ]
    );

    let versions = RemoteVersions::new(0, 1);
    let version = propose_daemon_state(&channel, &versions, &running(7))
        .await
        .expect("converge");
    assert_eq!(version, 3);
    assert_eq!(versions.daemon_state().load(Ordering::Acquire), 3);
    assert_eq!(
        server.coordinator.daemon_state.lock().expect("lock").value(),
        &Some(running(7))
    );

    channel.close(Duration::from_secs(2)).await;
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn remote_stop_daemon_round_trip() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let mut server = start_coordinator(0).await;
    let ctx = context(temp_dir.path());
    let channel = start_channel(&server.url, TOKEN, &ctx);
    wait_connected(&channel).await;

    server
        .rpc_tx
        .send(Frame::RpcRequest {
            id: "rpc-1".to_string(),
            method: "machine-test:stop-daemon".to_string(),
            params: Value::Null,
        })
        .expect("queue rpc");
    let response = tokio::time::timeout(Duration::from_secs(5), server.responses.recv())
        .await
        .expect("response in time")
        .expect("response");
    match response {
        Frame::RpcResponse { id, result } => {
            assert_eq!(id, "rpc-1");
            assert!(result["message"].as_str().is_some());
        }
        other => panic!("unexpected frame: {:?}", other),
    }
    assert_eq!(
        ctx.shutdown.requested().map(|request| request.source),
        Some(ShutdownSource::RemoteRpc)
    );

    server
        .rpc_tx
        .send(Frame::RpcRequest {
            id: "rpc-2".to_string(),
            method: "other-machine:stop-daemon".to_string(),
            params: Value::Null,
        })
        .expect("queue rpc");
    let response = tokio::time::timeout(Duration::from_secs(5), server.responses.recv())
        .await
        .expect("response in time")
        .expect("response");
    match response {
        Frame::RpcResponse { id, result } => {
            assert_eq!(id, "rpc-2");
            assert!(result["error"].as_str().is_some());
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    channel.close(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn bad_token_never_connects() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let server = start_coordinator(0).await;
    let ctx = context(temp_dir.path());
    let channel = start_channel(&server.url, "wrong-token", &ctx);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!channel.is_connected());
    assert!(matches!(
        channel.update_daemon_state(&running(1), 0).await,
        Err(ChannelError::NotConnected)
    ));
    assert!(server.coordinator.registered.lock().expect("lock").is_empty());

    channel.close(Duration::from_secs(2)).await;
}
