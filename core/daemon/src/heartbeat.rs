//! Periodic self-check.
//!
//! Each tick, in order: skip if the previous tick is still running, prune dead
//! sessions, check the installed binary for an upgrade, confirm the state file
//! still names this process, then refresh `lastHeartbeat`.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::process::binary_mtime_ms;
use crate::shutdown::ShutdownSource;
use crate::state_file::StateRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Previous tick still in flight.
    Skipped,
    /// Shutdown already under way; nothing written.
    ShuttingDown,
    Healthy { pruned: usize },
    VersionDrift,
    OwnershipLost,
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct TickPermit(Arc<AtomicBool>);

impl Drop for TickPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct HeartbeatLoop {
    ctx: Arc<DaemonContext>,
    in_flight: Arc<AtomicBool>,
}

impl HeartbeatLoop {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    fn try_permit(&self) -> Option<TickPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickPermit(Arc::clone(&self.in_flight)))
    }

    pub async fn tick(&self) -> TickOutcome {
        let Some(_permit) = self.try_permit() else {
            debug!("Previous heartbeat still running; skipping tick");
            return TickOutcome::Skipped;
        };
        if self.ctx.shutdown.is_requested() {
            return TickOutcome::ShuttingDown;
        }

        let pruned = self.ctx.registry.prune().len();

        if self.binary_changed() && self.restart_for_new_binary().await {
            return TickOutcome::VersionDrift;
        }

        match self.ctx.state_store.read() {
            StateRead::Found(record) if record.pid != self.ctx.stamp.pid => {
                warn!(
                    owner_pid = record.pid,
                    our_pid = self.ctx.stamp.pid,
                    "State file names another daemon"
                );
                self.ctx.shutdown.request(
                    ShutdownSource::OwnershipLost,
                    Some(format!("state file owned by PID {}", record.pid)),
                );
                return TickOutcome::OwnershipLost;
            }
            StateRead::Found(_) => {}
            StateRead::NotFound => warn!("State file missing; rewriting"),
            StateRead::Corrupt(reason) => warn!(reason = %reason, "State file corrupt; rewriting"),
        }

        // No await between this check and the write, so teardown cannot
        // delete the file underneath us.
        if self.ctx.shutdown.is_requested() {
            return TickOutcome::ShuttingDown;
        }
        if let Err(err) = self.ctx.write_state() {
            warn!(error = %err, "Failed to write heartbeat");
        }
        debug!(pruned, sessions = self.ctx.registry.len(), "Heartbeat");
        TickOutcome::Healthy { pruned }
    }

    fn binary_changed(&self) -> bool {
        let path = &self.ctx.config.binary_path;
        match (self.ctx.stamp.binary_mtime_ms, binary_mtime_ms(path)) {
            (Some(started), Some(current)) if started != current => {
                info!(
                    path = %path.display(),
                    started_mtime_ms = started,
                    current_mtime_ms = current,
                    "Installed daemon binary changed"
                );
                true
            }
            (Some(_), None) => {
                debug!(path = %path.display(), "Daemon binary missing; skipping version check");
                false
            }
            _ => false,
        }
    }

    /// Launches the new binary, then waits for it to stop us. Returns `false`
    /// if no replacement could be started.
    async fn restart_for_new_binary(&self) -> bool {
        let config = &self.ctx.config;
        let mut command = std::process::Command::new(&config.binary_path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        match command.spawn() {
            Ok(child) => info!(replacement_pid = child.id(), "Started replacement daemon"),
            Err(err) => {
                error!(error = %err, "Failed to start replacement daemon");
                return false;
            }
        }

        let grace = config.version_restart_grace;
        tokio::select! {
            request = self.ctx.shutdown.wait() => {
                info!(source = request.source.as_str(), "Replacement daemon took over");
            }
            _ = tokio::time::sleep(grace) => {
                self.ctx.shutdown.request(
                    ShutdownSource::VersionDrift,
                    Some(format!("replacement did not take over within {}s", grace.as_secs())),
                );
            }
        }
        true
    }

    /// Runs `tick` every `interval` until the returned handle is stopped.
    /// The first tick fires one full interval after start.
    pub fn spawn(self, interval: Duration) -> HeartbeatHandle {
        let heartbeat = Arc::new(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let heartbeat = Arc::clone(&heartbeat);
                        tokio::spawn(async move {
                            heartbeat.tick().await;
                        });
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Heartbeat loop stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "Heartbeat started");
        HeartbeatHandle { stop_tx, task }
    }
}

pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "Heartbeat task ended abnormally");
        }
    }
}
