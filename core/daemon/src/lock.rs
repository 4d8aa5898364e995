//! Single-instance lock for the daemon.
//!
//! The lock is a plain file created with `create_new` (O_CREAT | O_EXCL). The
//! kernel guarantees that exactly one of several racing creators wins; nothing
//! else is layered on top.
//!
//! # File Layout
//!
//! ```text
//! daemon.state.json.lock
//! 12345              <- owner PID
//! 9f3c2a6d1b0e4f77   <- generation token
//! ```
//!
//! # Stale Locks
//!
//! A lock whose owner PID is no longer alive is removed and the exclusive
//! create is retried once. An unreadable lock (owner crashed between create
//! and write) is only treated as stale once it is older than
//! `UNREADABLE_LOCK_STALE_AFTER`.
//!
//! Removal happens only while holding `<lock>.reclaim`, itself created with
//! `create_new`, and only if the lock still holds exactly what was judged
//! stale. Two starters that saw the same dead owner therefore cannot delete
//! each other's fresh lock.
//!
//! # Release
//!
//! `LockHandle::release` removes the file only when both PID and generation
//! token still match, so a handle that outlived a takeover cannot delete the
//! new owner's lock.

use fs_err as fs;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::process::is_pid_alive;

const UNREADABLE_LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Daemon lock {path} is held by PID {pid}")]
    AlreadyLocked { path: PathBuf, pid: u32 },

    #[error("Daemon lock {path} is being written by another process")]
    Contended { path: PathBuf },

    #[error("Lock I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

/// Proof of ownership returned by a successful `acquire`.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    owner: LockOwner,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the lock for the current process.
    pub fn acquire(&self) -> Result<LockHandle, LockError> {
        self.acquire_as(std::process::id())
    }

    fn acquire_as(&self, pid: u32) -> Result<LockHandle, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let owner = LockOwner {
            pid,
            token: Some(generation_token()),
        };

        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let body = format!(
                        "{}\n{}\n",
                        owner.pid,
                        owner.token.as_deref().unwrap_or_default()
                    );
                    file.write_all(body.as_bytes())
                        .and_then(|_| file.sync_all())
                        .map_err(|source| self.io_error(source))?;
                    info!(path = %self.path.display(), pid, "Daemon lock acquired");
                    return Ok(LockHandle {
                        path: self.path.clone(),
                        owner,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    self.check_existing(attempt)?;
                }
                Err(err) => return Err(self.io_error(err)),
            }
        }

        Err(LockError::Contended {
            path: self.path.clone(),
        })
    }

    /// Fails if the existing lock is live; removes it if stale.
    fn check_existing(&self, attempt: u32) -> Result<(), LockError> {
        match self.read_owner() {
            Some(existing) if is_pid_alive(existing.pid) => Err(LockError::AlreadyLocked {
                path: self.path.clone(),
                pid: existing.pid,
            }),
            Some(existing) => {
                warn!(
                    path = %self.path.display(),
                    stale_pid = existing.pid,
                    attempt,
                    "Reclaiming stale daemon lock"
                );
                self.reclaim(Some(existing))
            }
            None if self.is_aged() => {
                warn!(path = %self.path.display(), "Reclaiming unreadable daemon lock");
                self.reclaim(None)
            }
            None => Err(LockError::Contended {
                path: self.path.clone(),
            }),
        }
    }

    /// Removes the lock if it still holds `observed`. Anything else means
    /// another starter reclaimed it first and the caller retries the create.
    fn reclaim(&self, observed: Option<LockOwner>) -> Result<(), LockError> {
        let _guard = ReclaimGuard::acquire(self.reclaim_path())?;

        let current = self.read_owner();
        if current != observed || (current.is_none() && !self.is_aged()) {
            debug!(path = %self.path.display(), "Stale lock already reclaimed");
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn reclaim_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".reclaim");
        PathBuf::from(name)
    }

    pub fn read_owner(&self) -> Option<LockOwner> {
        read_owner(&self.path)
    }

    fn is_aged(&self) -> bool {
        file_age(&self.path).map_or(false, |age| age >= UNREADABLE_LOCK_STALE_AFTER)
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LockHandle {
    pub fn pid(&self) -> u32 {
        self.owner.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file if this handle still owns it.
    ///
    /// Returns `Ok(false)` when the file is gone or belongs to someone else.
    pub fn release(self) -> Result<bool, LockError> {
        match read_owner(&self.path) {
            Some(current) if current == self.owner => match fs::remove_file(&self.path) {
                Ok(()) => {
                    info!(path = %self.path.display(), "Daemon lock released");
                    Ok(true)
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(source) => Err(LockError::Io {
                    path: self.path.clone(),
                    source,
                }),
            },
            Some(current) => {
                warn!(
                    path = %self.path.display(),
                    owner_pid = current.pid,
                    "Daemon lock no longer ours; leaving it in place"
                );
                Ok(false)
            }
            None => {
                debug!(path = %self.path.display(), "Daemon lock already gone");
                Ok(false)
            }
        }
    }
}

/// Serializes stale-lock removal. Held only for a read and an unlink.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn acquire(path: PathBuf) -> Result<Self, LockError> {
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    // A guard this old was left by a starter that died mid-reclaim.
                    if file_age(&path).map_or(true, |age| age < UNREADABLE_LOCK_STALE_AFTER) {
                        break;
                    }
                    warn!(path = %path.display(), "Removing abandoned lock reclaim guard");
                    let _ = fs::remove_file(&path);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
        Err(LockError::Contended { path })
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "Failed to remove lock reclaim guard");
        }
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let pid: u32 = lines.next()?.trim().parse().ok()?;
    if pid == 0 {
        return None;
    }
    let token = lines
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    Some(LockOwner { pid, token })
}

fn generation_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}
