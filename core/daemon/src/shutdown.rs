//! First-wins shutdown coordination.
//!
//! Every trigger (signal, `/stop`, remote RPC, fault, ownership loss, version
//! drift) calls `ShutdownHandle::request`. Only the first call is recorded;
//! later ones are logged and ignored, so teardown has exactly one source.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSource {
    Signal,
    HttpStop,
    RemoteRpc,
    Fault,
    OwnershipLost,
    VersionDrift,
}

impl ShutdownSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSource::Signal => "os-signal",
            ShutdownSource::HttpStop => "http-stop",
            ShutdownSource::RemoteRpc => "remote-rpc",
            ShutdownSource::Fault => "fault",
            ShutdownSource::OwnershipLost => "ownership-lost",
            ShutdownSource::VersionDrift => "version-drift",
        }
    }

    /// Whether a shutdown from this source should exit non-zero.
    pub fn is_failure(&self) -> bool {
        matches!(self, ShutdownSource::Fault)
    }
}

impl std::fmt::Display for ShutdownSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub source: ShutdownSource,
    pub detail: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

struct ShutdownInner {
    request: Mutex<Option<ShutdownRequest>>,
    signal: watch::Sender<bool>,
}

/// Cloneable handle shared by everything that can end the daemon.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                request: Mutex::new(None),
                signal,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ShutdownRequest>> {
        self.inner
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a shutdown request. Returns `true` only for the first caller.
    pub fn request(&self, source: ShutdownSource, detail: Option<String>) -> bool {
        let mut slot = self.slot();
        if let Some(existing) = slot.as_ref() {
            debug!(
                ignored = source.as_str(),
                winner = existing.source.as_str(),
                "Shutdown already requested"
            );
            return false;
        }

        info!(
            source = source.as_str(),
            detail = detail.as_deref().unwrap_or(""),
            "Shutdown requested"
        );
        *slot = Some(ShutdownRequest {
            source,
            detail,
            requested_at: Utc::now(),
        });
        drop(slot);
        self.inner.signal.send_replace(true);
        true
    }

    pub fn requested(&self) -> Option<ShutdownRequest> {
        self.slot().clone()
    }

    pub fn is_requested(&self) -> bool {
        *self.inner.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.signal.subscribe()
    }

    /// Resolves with the winning request once any trigger fires.
    pub async fn wait(&self) -> ShutdownRequest {
        let mut rx = self.subscribe();
        loop {
            if let Some(request) = self.requested() {
                return request;
            }
            // The sender lives in `self`, so `changed` cannot fail here.
            let _ = rx.changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_wins() {
        let handle = ShutdownHandle::new();
        assert!(handle.request(ShutdownSource::HttpStop, None));
        assert!(!handle.request(ShutdownSource::Signal, Some("SIGTERM".to_string())));

        let request = handle.requested().expect("recorded");
        assert_eq!(request.source, ShutdownSource::HttpStop);
        assert!(handle.is_requested());
    }

    #[tokio::test]
    async fn wait_resolves_for_every_clone() {
        let handle = ShutdownHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::task::yield_now().await;
        handle.request(ShutdownSource::OwnershipLost, None);

        let request = waiter.await.expect("join");
        assert_eq!(request.source, ShutdownSource::OwnershipLost);
        // Already requested: resolves immediately.
        assert_eq!(handle.wait().await.source, ShutdownSource::OwnershipLost);
    }

    #[test]
    fn only_faults_are_failures() {
        assert!(ShutdownSource::Fault.is_failure());
        assert!(!ShutdownSource::VersionDrift.is_failure());
        assert_eq!(ShutdownSource::OwnershipLost.to_string(), "ownership-lost");
    }
}
