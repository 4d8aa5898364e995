//! Daemon lifecycle: `starting -> running -> shutting-down -> stopped`.
//!
//! # Startup
//!
//! 1. Refuse right away if a daemon from this build already runs.
//! 2. Crash-loop backoff.
//! 3. Replace a daemon from an older build, or refuse to start next to a
//!    current one.
//! 4. Acquire the lock.
//! 5. Bind the control server.
//! 6. Register the machine and start the channel (when a server is configured).
//! 7. Write the state file.
//! 8. Start the heartbeat and the signal listener.
//!
//! # Teardown
//!
//! Runs once, after the first shutdown trigger. Every step is best-effort and
//! logs its own failure: stop the heartbeat, broadcast `shutting-down`, close
//! the channel, stop the control server, delete the state file, release the
//! lock.

use relay_daemon_protocol::machine::{
    DaemonStatus, MachineMetadata, RegisterMachineRequest, RemoteDaemonState, UpdateResult,
    EVENT_UPDATE_METADATA, EVENT_UPDATE_STATE,
};
use relay_daemon_protocol::DaemonStateRecord;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{register_machine, request_local_stop};
use crate::backoff::apply_startup_backoff;
use crate::config::DaemonConfig;
use crate::context::{DaemonContext, RpcDispatcher, StartupStamp};
use crate::control::{bind_listener, router, ControlServer};
use crate::error::{DaemonError, Result};
use crate::heartbeat::{HeartbeatHandle, HeartbeatLoop};
use crate::lock::{LockError, LockFile, LockHandle};
use crate::machine::{ChannelConfig, ChannelError, MachineChannel, RemoteVersions};
use crate::process::{host_name, is_pid_alive, terminate, wait_for_exit};
use crate::registry::ProcessRegistry;
use crate::shutdown::{Lifecycle, ShutdownHandle, ShutdownRequest, ShutdownSource};
use crate::state_file::{StateRead, StateStore};

/// Proposals rejected with `version-mismatch` are retried this many times in
/// total, each time with the authoritative version from the last ack.
pub const MAX_UPDATE_ATTEMPTS: usize = 3;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TAKEOVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const FINAL_BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Supervisor {
    ctx: Arc<DaemonContext>,
    lifecycle: Lifecycle,
    lock: Option<LockHandle>,
    control: Option<ControlServer>,
    channel: Option<Arc<MachineChannel>>,
    versions: Arc<RemoteVersions>,
    announcer: Option<JoinHandle<()>>,
    heartbeat: Option<HeartbeatHandle>,
    signals: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Runs the startup sequence. On error, anything already acquired is
    /// released before returning.
    pub async fn start(config: DaemonConfig, log_path: Option<PathBuf>) -> Result<Self> {
        info!(
            pid = std::process::id(),
            version = env!("CARGO_PKG_VERSION"),
            home = %config.home_dir.display(),
            "Daemon starting"
        );
        let state_store = StateStore::new(config.state_path());
        let stamp = StartupStamp::capture(&config);
        let lock_file = LockFile::new(config.lock_path());

        // Duplicates fail before they count as a crash-loop start.
        refuse_duplicate_start(&state_store, &lock_file, &stamp)?;
        apply_startup_backoff(&config.backoff_path()).await;

        take_over_stale_daemon(&state_store, &lock_file, &stamp, &config).await?;

        let machine_id = match config.server {
            Some(_) => Some(config.load_or_create_machine_id()?),
            None => None,
        };

        let lock = lock_file.acquire().map_err(|err| match err {
            LockError::AlreadyLocked { pid, .. } => DaemonError::AlreadyRunning { pid },
            other => DaemonError::Lock(other),
        })?;

        let (listener, http_port) = match bind_listener(config.http_port).await {
            Ok(bound) => bound,
            Err(err) => {
                release_lock(lock);
                return Err(err);
            }
        };

        let ctx = Arc::new(DaemonContext {
            config,
            registry: Arc::new(ProcessRegistry::new()),
            state_store,
            shutdown: ShutdownHandle::new(),
            stamp,
            http_port,
            log_path,
        });
        let control = ControlServer::serve(
            listener,
            http_port,
            router(Arc::clone(&ctx)),
            ctx.shutdown.clone(),
        );

        let mut supervisor = Self {
            ctx,
            lifecycle: Lifecycle::Starting,
            lock: Some(lock),
            control: Some(control),
            channel: None,
            versions: Arc::new(RemoteVersions::default()),
            announcer: None,
            heartbeat: None,
            signals: None,
        };

        if let Err(err) = supervisor.finish_startup(machine_id).await {
            error!(error = %err, "Daemon startup failed");
            supervisor.teardown(None).await;
            return Err(err);
        }
        Ok(supervisor)
    }

    async fn finish_startup(&mut self, machine_id: Option<String>) -> Result<()> {
        if let (Some(server), Some(machine_id)) = (self.ctx.config.server.clone(), machine_id) {
            let metadata = machine_metadata(&self.ctx.config);
            let running = running_state(&self.ctx);

            let registration = RegisterMachineRequest {
                id: machine_id.clone(),
                metadata: metadata.clone(),
                daemon_state: running.clone(),
            };
            match register_machine(&server, &registration, REGISTRATION_TIMEOUT).await {
                Ok(record) => {
                    info!(
                        machine_id = %record.id,
                        metadata_version = record.metadata_version,
                        daemon_state_version = record.daemon_state_version,
                        "Machine registered"
                    );
                    self.versions = Arc::new(RemoteVersions::new(
                        record.metadata_version,
                        record.daemon_state_version,
                    ));
                }
                Err(err) => warn!(error = %err, "Machine registration failed; continuing"),
            }

            let channel = MachineChannel::start(
                ChannelConfig {
                    server_url: server.url.clone(),
                    token: server.token.clone(),
                    machine_id,
                    beacon_interval: self.ctx.config.beacon_interval,
                    request_timeout: CHANNEL_REQUEST_TIMEOUT,
                },
                Arc::new(RpcDispatcher::new(Arc::clone(&self.ctx))),
            )
            .map_err(|err| DaemonError::InvalidServerUrl {
                url: server.url.to_string(),
                details: err.to_string(),
            })?;
            let channel = Arc::new(channel);

            self.announcer = Some(spawn_announcer(
                Arc::clone(&channel),
                Arc::clone(&self.versions),
                metadata,
                running,
                self.ctx.shutdown.clone(),
            ));
            self.channel = Some(channel);
        } else {
            info!("No server configured; machine channel disabled");
        }

        self.ctx.write_state()?;

        self.heartbeat = Some(
            HeartbeatLoop::new(Arc::clone(&self.ctx)).spawn(self.ctx.config.heartbeat_interval),
        );
        self.signals = Some(spawn_signal_listener(self.ctx.shutdown.clone())?);

        self.lifecycle = Lifecycle::Running;
        info!(
            pid = self.ctx.stamp.pid,
            http_port = self.ctx.http_port,
            "Daemon running"
        );
        Ok(())
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.ctx.shutdown.clone()
    }

    pub fn http_port(&self) -> u16 {
        self.ctx.http_port
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Waits for the first shutdown trigger, tears down, and returns it.
    pub async fn run(mut self) -> ShutdownRequest {
        let request = self.ctx.shutdown.wait().await;
        info!(
            source = request.source.as_str(),
            detail = request.detail.as_deref().unwrap_or(""),
            "Daemon shutting down"
        );
        self.teardown(Some(&request)).await;
        request
    }

    async fn teardown(&mut self, request: Option<&ShutdownRequest>) {
        self.lifecycle = Lifecycle::ShuttingDown;

        if let Some(signals) = self.signals.take() {
            signals.abort();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        if let Some(announcer) = self.announcer.take() {
            announcer.abort();
        }

        if let Some(channel) = self.channel.take() {
            let state = shutting_down_state(&self.ctx, request);
            match tokio::time::timeout(
                FINAL_BROADCAST_TIMEOUT,
                propose_daemon_state(&channel, &self.versions, &state),
            )
            .await
            {
                Ok(Ok(version)) => debug!(version, "Broadcast shutting-down state"),
                Ok(Err(err)) => warn!(error = %err, "Failed to broadcast shutting-down state"),
                Err(_) => warn!("Timed out broadcasting shutting-down state"),
            }
            channel.close(CLOSE_TIMEOUT).await;
        }

        if let Some(control) = self.control.take() {
            control.stop(CLOSE_TIMEOUT).await;
        }

        match self.ctx.state_store.read() {
            StateRead::Found(record) if record.pid != self.ctx.stamp.pid => {
                info!(owner_pid = record.pid, "State file belongs to another daemon; leaving it");
            }
            _ => match self.ctx.state_store.delete() {
                Ok(true) => debug!("State file removed"),
                Ok(false) => debug!("State file already absent"),
                Err(err) => warn!(error = %err, "Failed to remove state file"),
            },
        }

        if let Some(lock) = self.lock.take() {
            release_lock(lock);
        }

        self.lifecycle = Lifecycle::Stopped;
        info!("Daemon stopped");
    }
}

/// Routes panics anywhere in the process to a `fault` shutdown.
pub fn install_panic_hook(shutdown: ShutdownHandle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        shutdown.request(ShutdownSource::Fault, Some(info.to_string()));
        previous(info);
    }));
}

fn release_lock(lock: LockHandle) {
    match lock.release() {
        Ok(true) => {}
        Ok(false) => debug!("Lock was not ours to release"),
        Err(err) => warn!(error = %err, "Failed to release daemon lock"),
    }
}

fn is_same_build(record: &DaemonStateRecord, stamp: &StartupStamp) -> bool {
    record.started_with_cli_version == stamp.version
        && stamp
            .binary_mtime_ms
            .map_or(true, |mtime| mtime == record.started_with_cli_mtime_ms)
}

/// Fails fast when a live daemon from this build already owns the home
/// directory. A live daemon from an older build is left to the takeover.
fn refuse_duplicate_start(
    state_store: &StateStore,
    lock_file: &LockFile,
    stamp: &StartupStamp,
) -> Result<()> {
    if let StateRead::Found(record) = state_store.read() {
        if record.pid != stamp.pid && is_pid_alive(record.pid) {
            return match is_same_build(&record, stamp) {
                true => Err(DaemonError::AlreadyRunning { pid: record.pid }),
                false => Ok(()),
            };
        }
    }
    match lock_file.read_owner() {
        Some(owner) if owner.pid != stamp.pid && is_pid_alive(owner.pid) => {
            Err(DaemonError::AlreadyRunning { pid: owner.pid })
        }
        _ => Ok(()),
    }
}

/// Stops a live daemon from an older build so this one can take over.
/// A live daemon from the same build means this start is a duplicate.
async fn take_over_stale_daemon(
    state_store: &StateStore,
    lock_file: &LockFile,
    stamp: &StartupStamp,
    config: &DaemonConfig,
) -> Result<()> {
    let record = match state_store.read() {
        StateRead::Found(record) => record,
        StateRead::NotFound => return Ok(()),
        StateRead::Corrupt(reason) => {
            warn!(reason = %reason, "Ignoring corrupt state file at startup");
            return Ok(());
        }
    };
    if record.pid == stamp.pid || !is_pid_alive(record.pid) {
        debug!(pid = record.pid, "Previous daemon is not running");
        return Ok(());
    }

    if is_same_build(&record, stamp) {
        return Err(DaemonError::AlreadyRunning { pid: record.pid });
    }

    info!(
        old_pid = record.pid,
        old_version = %record.started_with_cli_version,
        new_version = %stamp.version,
        "Replacing daemon from an older build"
    );
    if let Err(err) = request_local_stop(record.http_port, TAKEOVER_STOP_TIMEOUT).await {
        warn!(error = %err, "Old daemon did not accept stop request");
    }
    if wait_for_exit(record.pid, config.stop_grace).await {
        return Ok(());
    }

    // Only signal the PID if the lock confirms it is still the daemon.
    match lock_file.read_owner() {
        Some(owner) if owner.pid == record.pid => {
            warn!(old_pid = record.pid, "Old daemon ignored stop; terminating");
            terminate(record.pid, config.stop_grace).await;
        }
        _ => debug!(old_pid = record.pid, "Old daemon no longer holds the lock"),
    }
    Ok(())
}

fn spawn_signal_listener(shutdown: ShutdownHandle) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|err| DaemonError::io("install SIGTERM handler", err))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|err| DaemonError::io("install SIGINT handler", err))?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        info!(signal = name, "Received signal");
        shutdown.request(ShutdownSource::Signal, Some(name.to_string()));
    }))
}

/// Re-announces metadata and daemon state after every (re)connect.
fn spawn_announcer(
    channel: Arc<MachineChannel>,
    versions: Arc<RemoteVersions>,
    metadata: MachineMetadata,
    running: RemoteDaemonState,
    shutdown: ShutdownHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connection = channel.connection_state();
        loop {
            if connection.wait_for(|connected| *connected).await.is_err() {
                break;
            }
            if shutdown.is_requested() {
                break;
            }
            if let Err(err) = propose_metadata(&channel, &versions, &metadata).await {
                warn!(error = %err, "Failed to sync machine metadata");
            }
            match propose_daemon_state(&channel, &versions, &running).await {
                Ok(version) => info!(version, "Announced running daemon state"),
                Err(err) => warn!(error = %err, "Failed to announce daemon state"),
            }
            if connection.wait_for(|connected| !*connected).await.is_err() {
                break;
            }
        }
    })
}

/// Proposes with the last known version; on mismatch adopts the
/// authoritative version and tries again, up to `MAX_UPDATE_ATTEMPTS`.
async fn propose_with_retry<F, Fut>(
    event: &str,
    version: &AtomicU64,
    mut propose: F,
) -> std::result::Result<u64, ChannelError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = std::result::Result<(UpdateResult, u64), ChannelError>>,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let expected = version.load(Ordering::Acquire);
        let (result, authoritative) = propose(expected).await?;
        match result {
            UpdateResult::Success => {
                version.store(authoritative, Ordering::Release);
                return Ok(authoritative);
            }
            UpdateResult::VersionMismatch => {
                debug!(event, attempt, expected, authoritative, "Version mismatch");
                version.store(authoritative, Ordering::Release);
            }
            UpdateResult::Error => {
                return Err(ChannelError::Rejected {
                    event: event.to_string(),
                })
            }
        }
    }
    Err(ChannelError::VersionConflict {
        event: event.to_string(),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}

pub async fn propose_daemon_state(
    channel: &MachineChannel,
    versions: &RemoteVersions,
    state: &RemoteDaemonState,
) -> std::result::Result<u64, ChannelError> {
    propose_with_retry(EVENT_UPDATE_STATE, versions.daemon_state(), move |expected| async move {
        let ack = channel.update_daemon_state(state, expected).await?;
        Ok::<_, ChannelError>((ack.result, ack.version))
    })
    .await
}

pub async fn propose_metadata(
    channel: &MachineChannel,
    versions: &RemoteVersions,
    metadata: &MachineMetadata,
) -> std::result::Result<u64, ChannelError> {
    propose_with_retry(EVENT_UPDATE_METADATA, versions.metadata(), move |expected| async move {
        let ack = channel.update_metadata(metadata, expected).await?;
        Ok::<_, ChannelError>((ack.result, ack.version))
    })
    .await
}

pub fn machine_metadata(config: &DaemonConfig) -> MachineMetadata {
    MachineMetadata {
        host: host_name(),
        platform: std::env::consts::OS.to_string(),
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        home_dir: dirs::home_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
        relay_home_dir: config.home_dir.display().to_string(),
        relay_lib_dir: config
            .binary_path
            .parent()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
    }
}

fn running_state(ctx: &DaemonContext) -> RemoteDaemonState {
    RemoteDaemonState {
        status: DaemonStatus::Running,
        pid: Some(ctx.stamp.pid),
        http_port: Some(ctx.http_port),
        started_at: Some(ctx.stamp.start_time.timestamp_millis()),
        shutdown_requested_at: None,
        shutdown_source: None,
    }
}

fn shutting_down_state(ctx: &DaemonContext, request: Option<&ShutdownRequest>) -> RemoteDaemonState {
    RemoteDaemonState {
        status: DaemonStatus::ShuttingDown,
        shutdown_requested_at: request.map(|request| request.requested_at.timestamp_millis()),
        shutdown_source: request.map(|request| request.source.as_str().to_string()),
        ..running_state(ctx)
    }
}
