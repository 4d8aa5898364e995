//! Persisted daemon state (`daemon.state.json`).
//!
//! Rewritten on every heartbeat and deleted on graceful shutdown. Writes go
//! through a temp file and rename, but readers still treat any partial or
//! unparseable content as `Corrupt` instead of failing.

use fs_err as fs;
use relay_daemon_protocol::DaemonStateRecord;
use std::path::{Path, PathBuf};

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateRead {
    Found(DaemonStateRecord),
    NotFound,
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> StateRead {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StateRead::NotFound,
            Err(err) => return StateRead::Corrupt(format!("unreadable: {}", err)),
        };

        let record: DaemonStateRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(err) => return StateRead::Corrupt(format!("invalid JSON: {}", err)),
        };

        match record.validate() {
            Ok(()) => StateRead::Found(record),
            Err(err) => StateRead::Corrupt(format!("{}: {}", err.code, err.message)),
        }
    }

    pub fn write(&self, record: &DaemonStateRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| DaemonError::io("create state directory", err))?;
        }

        let payload = serde_json::to_vec_pretty(record).map_err(|err| DaemonError::Json {
            context: "serialize daemon state".to_string(),
            source: err,
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).map_err(|err| DaemonError::io("write daemon state", err))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|err| DaemonError::io("commit daemon state", err))?;
        Ok(())
    }

    /// Returns whether a file was actually removed.
    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(DaemonError::io("delete daemon state", err)),
        }
    }
}
