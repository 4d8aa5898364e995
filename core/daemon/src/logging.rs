//! Tracing setup: stderr plus a per-start file under `<home>/logs/`.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the file writer flushing. Hold it for the life of the process.
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
    path: Option<PathBuf>,
}

impl LogGuard {
    /// File the daemon is logging to, if file logging could be set up.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

pub fn log_file_name(pid: u32) -> String {
    format!(
        "daemon-{}-pid-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        pid
    )
}

fn filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Stderr-only logging, for failures before the home directory is known.
pub fn init_stderr(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(filter(debug))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub fn init(logs_dir: &Path, debug: bool) -> LogGuard {
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_name = log_file_name(std::process::id());
    let file = fs_err::create_dir_all(logs_dir)
        .and_then(|_| fs_err::File::create(logs_dir.join(&file_name)));

    match file {
        Ok(file) => {
            let (writer, worker) = tracing_appender::non_blocking(file.into_parts().0);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(filter(debug))
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            LogGuard {
                _worker: Some(worker),
                path: Some(logs_dir.join(file_name)),
            }
        }
        Err(err) => {
            let _ = tracing_subscriber::registry()
                .with(filter(debug))
                .with(stderr_layer)
                .try_init();
            tracing::warn!(error = %err, dir = %logs_dir.display(), "File logging unavailable");
            LogGuard {
                _worker: None,
                path: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name_embeds_pid() {
        let name = log_file_name(4242);
        assert!(name.starts_with("daemon-"));
        assert!(name.ends_with("-pid-4242.log"));
    }
}
