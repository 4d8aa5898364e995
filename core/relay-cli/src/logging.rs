//! Stderr logging. Quiet by default so command output stays readable.

use tracing_subscriber::EnvFilter;

const DEBUG_LOG_ENV: &str = "RELAY_DEBUG_LOG";

pub fn init() {
    let debug = std::env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
