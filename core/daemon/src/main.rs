//! relay-daemon entrypoint.

use std::process::ExitCode;
use tracing::{error, info, warn};

use relay_daemon::config::DaemonConfig;
use relay_daemon::logging;
use relay_daemon::supervisor::{install_panic_hook, Supervisor};

fn main() -> ExitCode {
    let config = match DaemonConfig::load() {
        Ok(config) => config,
        Err(err) => {
            logging::init_stderr(false);
            error!(error = %err, "Failed to load daemon configuration");
            return ExitCode::FAILURE;
        }
    };
    let log_guard = logging::init(&config.logs_dir(), config.debug_log);
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to build async runtime");
            return ExitCode::FAILURE;
        }
    };

    let log_path = log_guard.path().map(|path| path.to_path_buf());
    runtime.block_on(async move {
        let supervisor = match Supervisor::start(config, log_path).await {
            Ok(supervisor) => supervisor,
            Err(err) => {
                error!(error = %err, "Daemon failed to start");
                return ExitCode::FAILURE;
            }
        };
        install_panic_hook(supervisor.shutdown_handle());

        let request = supervisor.run().await;
        info!(source = request.source.as_str(), "Daemon exiting");
        if request.source.is_failure() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        }
    })
}
