//! Crash-loop protection.
//!
//! Recent start times are kept in `daemon-backoff.json`. Once more than
//! `MAX_STARTS_IN_WINDOW` starts land inside `WINDOW_SECS`, each extra start waits
//! `STEP` longer before continuing, up to `MAX_DELAY`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};

const WINDOW_SECS: i64 = 120;
const MAX_STARTS_IN_WINDOW: usize = 3;
const STEP: Duration = Duration::from_secs(10);
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupHistory {
    starts: Vec<DateTime<Utc>>,
}

impl StartupHistory {
    /// Missing or unreadable history starts empty.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|err| {
                warn!(error = %err, path = %path.display(), "Discarding unreadable start history");
                Self::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to read start history");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| DaemonError::io("create backoff directory", err))?;
        }
        let payload = serde_json::to_vec_pretty(self).map_err(|err| DaemonError::Json {
            context: "serialize start history".to_string(),
            source: err,
        })?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).map_err(|err| DaemonError::io("write start history", err))?;
        fs::rename(&tmp_path, path).map_err(|err| DaemonError::io("commit start history", err))
    }

    /// Forgets starts outside the window, records `now`, and returns the
    /// delay this start should wait.
    pub fn record_start(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let window = ChronoDuration::seconds(WINDOW_SECS);
        self.starts.retain(|start| now.signed_duration_since(*start) <= window);
        self.starts.push(now);

        let extra = self.starts.len().checked_sub(MAX_STARTS_IN_WINDOW)?;
        if extra == 0 {
            return None;
        }
        Some((STEP * extra as u32).min(MAX_DELAY))
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

/// Records this start and sleeps if the daemon is crash-looping.
pub async fn apply_startup_backoff(path: &Path) {
    let mut history = StartupHistory::load(path);
    let delay = history.record_start(Utc::now());
    if let Err(err) = history.save(path) {
        warn!(error = %err, "Failed to persist start history");
    }

    match delay {
        Some(delay) => {
            warn!(
                recent_starts = history.len(),
                delay_secs = delay.as_secs(),
                "Daemon restarting too often; delaying startup"
            );
            tokio::time::sleep(delay).await;
        }
        None => debug!(recent_starts = history.len(), "No startup backoff"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_at(now: DateTime<Utc>, ages_secs: &[i64]) -> StartupHistory {
        StartupHistory {
            starts: ages_secs
                .iter()
                .map(|age| now - ChronoDuration::seconds(*age))
                .collect(),
        }
    }

    #[test]
    fn fourth_start_in_window_waits_one_step() {
        let now = Utc::now();
        let mut history = history_at(now, &[30, 20, 10]);
        assert_eq!(history.record_start(now), Some(STEP));
    }

    #[test]
    fn third_start_is_free() {
        let now = Utc::now();
        let mut history = history_at(now, &[20, 10]);
        assert_eq!(history.record_start(now), None);
    }

    #[test]
    fn delay_is_capped() {
        let now = Utc::now();
        let ages: Vec<i64> = (1..=20).collect();
        let mut history = history_at(now, &ages);
        assert_eq!(history.record_start(now), Some(MAX_DELAY));
    }

    #[test]
    fn old_starts_fall_out_of_window() {
        let now = Utc::now();
        let mut history = history_at(now, &[130, 140, 150, 160]);
        assert_eq!(history.record_start(now), None);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn history_persists() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("daemon-backoff.json");
        assert!(StartupHistory::load(&path).is_empty());

        let mut history = StartupHistory::default();
        history.record_start(Utc::now());
        history.save(&path).expect("save");
        assert_eq!(StartupHistory::load(&path), history);

        fs::write(&path, "not json").expect("corrupt");
        assert!(StartupHistory::load(&path).is_empty());
    }
}
