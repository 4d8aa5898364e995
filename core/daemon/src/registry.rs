//! In-memory registry of sessions tracked by this daemon.
//!
//! Entries are keyed by OS PID. A session is identified externally by its
//! remote id (`happySessionId`) once the child has reported one, and by the
//! `PID-<n>` placeholder before that.
//!
//! Entries only leave the registry through `prune`, `remove_by_pid` (child
//! reaped), or an explicit stop. A `list` snapshot therefore contains only
//! live processes and processes not yet confirmed dead.

use chrono::{DateTime, Utc};
use relay_daemon_protocol::{
    ChildSummary, SessionMetadata, SessionStartedRequest, StartedBy, PID_SESSION_PREFIX,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::process::is_pid_alive;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSession {
    pub pid: u32,
    pub started_by: StartedBy,
    pub happy_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub directory: Option<String>,
    pub metadata: Option<SessionMetadata>,
}

impl TrackedSession {
    /// External identifier: the remote id, or `PID-<n>` until one is reported.
    pub fn session_id(&self) -> String {
        self.happy_session_id
            .clone()
            .unwrap_or_else(|| pid_session_id(self.pid))
    }

    pub fn summary(&self) -> ChildSummary {
        ChildSummary {
            started_by: self.started_by,
            happy_session_id: self.happy_session_id.clone(),
            pid: self.pid,
        }
    }
}

pub fn pid_session_id(pid: u32) -> String {
    format!("{}{}", PID_SESSION_PREFIX, pid)
}

fn parse_pid_session_id(session_id: &str) -> Option<u32> {
    session_id.strip_prefix(PID_SESSION_PREFIX)?.parse().ok()
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<u32, TrackedSession>,
    /// Spawn requests waiting for their child's webhook, keyed by PID.
    awaiting_webhook: HashMap<u32, oneshot::Sender<String>>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or updates the entry for `session_id`.
    ///
    /// Idempotent: tracking the same id twice leaves one entry. If the id is
    /// already tracked under a different PID, the entry moves to `pid`.
    pub fn track(&self, session_id: &str, pid: u32, started_by: StartedBy) -> TrackedSession {
        let mut inner = self.lock();
        let remote_id = parse_pid_session_id(session_id)
            .is_none()
            .then(|| session_id.to_string());

        let previous_pid = remote_id.as_ref().and_then(|id| {
            inner
                .sessions
                .values()
                .find(|session| session.happy_session_id.as_ref() == Some(id))
                .map(|session| session.pid)
        });

        let mut entry = previous_pid
            .and_then(|old_pid| inner.sessions.remove(&old_pid))
            .or_else(|| inner.sessions.remove(&pid))
            .unwrap_or_else(|| TrackedSession {
                pid,
                started_by,
                happy_session_id: None,
                created_at: Utc::now(),
                directory: None,
                metadata: None,
            });

        entry.pid = pid;
        entry.started_by = started_by;
        if remote_id.is_some() {
            entry.happy_session_id = remote_id;
        }

        inner.sessions.insert(pid, entry.clone());
        entry
    }

    /// Records a child the daemon just spawned, before it reports in.
    pub fn register_spawned(&self, pid: u32, directory: &str) {
        let mut inner = self.lock();
        inner.sessions.insert(
            pid,
            TrackedSession {
                pid,
                started_by: StartedBy::Daemon,
                happy_session_id: None,
                created_at: Utc::now(),
                directory: Some(directory.to_string()),
                metadata: None,
            },
        );
        debug!(pid, directory, "Tracking daemon-spawned session");
    }

    /// Applies a `/session-started` webhook.
    ///
    /// A daemon-spawned child keeps `startedBy: daemon`; an unknown PID is
    /// registered as reported (terminal by default). Any spawn request
    /// waiting on this PID is completed.
    pub fn on_session_webhook(&self, request: &SessionStartedRequest) -> TrackedSession {
        let pid = request.metadata.host_pid;
        let started_by = {
            let inner = self.lock();
            inner
                .sessions
                .get(&pid)
                .map(|existing| existing.started_by)
                .or(request.metadata.started_by)
                .unwrap_or(StartedBy::Terminal)
        };

        let mut session = self.track(&request.session_id, pid, started_by);

        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.get_mut(&pid) {
            entry.metadata = Some(request.metadata.clone());
            if entry.directory.is_none() {
                entry.directory = request.metadata.path.clone();
            }
            session = entry.clone();
        }
        if let Some(waiter) = inner.awaiting_webhook.remove(&pid) {
            let _ = waiter.send(request.session_id.clone());
        }

        info!(
            session_id = %request.session_id,
            pid,
            started_by = started_by.as_str(),
            "Session reported"
        );
        session
    }

    /// Returns a receiver completed with the session id once `pid` reports.
    ///
    /// Resolves immediately if the webhook already arrived.
    pub fn expect_webhook(&self, pid: u32) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let reported = inner
            .sessions
            .get(&pid)
            .and_then(|session| session.happy_session_id.clone());
        match reported {
            Some(session_id) => {
                let _ = tx.send(session_id);
            }
            None => {
                inner.awaiting_webhook.insert(pid, tx);
            }
        }
        rx
    }

    pub fn cancel_webhook(&self, pid: u32) {
        self.lock().awaiting_webhook.remove(&pid);
    }

    /// Maps a session id (remote id or `PID-<n>`) to a tracked PID.
    pub fn resolve(&self, session_id: &str) -> Option<u32> {
        let inner = self.lock();
        if let Some(session) = inner
            .sessions
            .values()
            .find(|session| session.happy_session_id.as_deref() == Some(session_id))
        {
            return Some(session.pid);
        }
        parse_pid_session_id(session_id).filter(|pid| inner.sessions.contains_key(pid))
    }

    pub fn get(&self, pid: u32) -> Option<TrackedSession> {
        self.lock().sessions.get(&pid).cloned()
    }

    pub fn remove_by_pid(&self, pid: u32) -> Option<TrackedSession> {
        let mut inner = self.lock();
        inner.awaiting_webhook.remove(&pid);
        inner.sessions.remove(&pid)
    }

    /// Drops every entry whose process no longer exists.
    pub fn prune(&self) -> Vec<TrackedSession> {
        self.prune_with(is_pid_alive)
    }

    pub fn prune_with<F>(&self, is_alive: F) -> Vec<TrackedSession>
    where
        F: Fn(u32) -> bool,
    {
        let mut inner = self.lock();
        let dead: Vec<u32> = inner
            .sessions
            .keys()
            .copied()
            .filter(|pid| !is_alive(*pid))
            .collect();

        let mut removed = Vec::with_capacity(dead.len());
        for pid in dead {
            inner.awaiting_webhook.remove(&pid);
            if let Some(session) = inner.sessions.remove(&pid) {
                info!(
                    pid,
                    session_id = %session.session_id(),
                    "Pruned dead session"
                );
                removed.push(session);
            }
        }
        removed
    }

    /// Snapshot ordered by creation time.
    pub fn list(&self) -> Vec<TrackedSession> {
        let mut sessions: Vec<TrackedSession> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.pid.cmp(&b.pid)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn webhook(session_id: &str, pid: u32, started_by: Option<StartedBy>) -> SessionStartedRequest {
        SessionStartedRequest {
            session_id: session_id.to_string(),
            metadata: SessionMetadata {
                host_pid: pid,
                started_by,
                path: Some("/repo".to_string()),
                extra: Map::new(),
            },
        }
    }

    #[test]
    fn track_is_idempotent_on_session_id() {
        let registry = ProcessRegistry::new();
        registry.track("session-a", 500, StartedBy::Terminal);
        registry.track("session-a", 500, StartedBy::Terminal);
        assert_eq!(registry.len(), 1);

        let moved = registry.track("session-a", 501, StartedBy::Terminal);
        assert_eq!(moved.pid, 501);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve("session-a"), Some(501));
    }

    #[test]
    fn webhook_attaches_remote_id_to_spawned_child() {
        let registry = ProcessRegistry::new();
        registry.register_spawned(700, "/repo");

        let session = registry.on_session_webhook(&webhook("remote-1", 700, None));
        assert_eq!(session.started_by, StartedBy::Daemon);
        assert_eq!(session.happy_session_id.as_deref(), Some("remote-1"));
        assert_eq!(session.directory.as_deref(), Some("/repo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn webhook_from_unknown_pid_is_terminal() {
        let registry = ProcessRegistry::new();
        let session = registry.on_session_webhook(&webhook("remote-2", 800, None));
        assert_eq!(session.started_by, StartedBy::Terminal);
        assert_eq!(registry.list()[0].summary().pid, 800);
    }

    #[test]
    fn resolve_accepts_pid_placeholder() {
        let registry = ProcessRegistry::new();
        registry.register_spawned(900, "/repo");
        assert_eq!(registry.resolve("PID-900"), Some(900));
        assert_eq!(registry.resolve("PID-901"), None);
        assert_eq!(registry.resolve("unknown"), None);
    }

    #[test]
    fn prune_removes_only_dead_entries() {
        let registry = ProcessRegistry::new();
        registry.track("alive", 10, StartedBy::Terminal);
        registry.track("dead", 11, StartedBy::Terminal);

        let removed = registry.prune_with(|pid| pid == 10);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].pid, 11);
        assert_eq!(registry.resolve("alive"), Some(10));
        assert_eq!(registry.resolve("dead"), None);
    }

    #[test]
    fn prune_drops_exited_process() {
        let registry = ProcessRegistry::new();
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id();
        registry.track("short-lived", pid, StartedBy::Terminal);
        child.wait().expect("wait");

        registry.prune();
        assert!(registry.list().iter().all(|session| session.pid != pid));
    }

    #[tokio::test]
    async fn webhook_completes_pending_spawn() {
        let registry = ProcessRegistry::new();
        registry.register_spawned(1000, "/repo");
        let waiter = registry.expect_webhook(1000);
        registry.on_session_webhook(&webhook("remote-3", 1000, Some(StartedBy::Daemon)));
        assert_eq!(waiter.await.expect("webhook"), "remote-3");
    }

    #[tokio::test]
    async fn expect_webhook_resolves_if_already_reported() {
        let registry = ProcessRegistry::new();
        registry.register_spawned(1100, "/repo");
        registry.on_session_webhook(&webhook("remote-4", 1100, None));
        let waiter = registry.expect_webhook(1100);
        assert_eq!(waiter.await.expect("webhook"), "remote-4");
    }
}
