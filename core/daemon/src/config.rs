//! Daemon configuration.
//!
//! Resolution order: built-in defaults, then `<home>/daemon.toml`, then
//! environment variables. The home directory itself comes from
//! `RELAY_HOME_DIR` or `~/.relay`.

use fs_err as fs;
use relay_daemon_protocol::{LOCK_FILE_NAME, STATE_FILE_NAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{DaemonError, Result};

pub const HOME_DIR_ENV: &str = "RELAY_HOME_DIR";
pub const SERVER_URL_ENV: &str = "RELAY_SERVER_URL";
pub const TOKEN_ENV: &str = "RELAY_TOKEN";
pub const HEARTBEAT_INTERVAL_ENV: &str = "RELAY_HEARTBEAT_INTERVAL_MS";
pub const DEBUG_LOG_ENV: &str = "RELAY_DEBUG_LOG";

const DEFAULT_HOME_DIR_NAME: &str = ".relay";
const CONFIG_FILE_NAME: &str = "daemon.toml";
const SETTINGS_FILE_NAME: &str = "settings.json";
const ACCESS_KEY_FILE_NAME: &str = "access.key";
const BACKOFF_FILE_NAME: &str = "daemon-backoff.json";
const LOGS_DIR_NAME: &str = "logs";

const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_BEACON_INTERVAL_MS: u64 = 20_000;
const DEFAULT_VERSION_RESTART_GRACE_MS: u64 = 10_000;
const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub url: Url,
    pub token: String,
}

/// Program (plus arguments) launched for a spawned session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SessionCommand {
    fn default_for(binary_path: &Path) -> Self {
        let program = binary_path
            .parent()
            .map(|dir| dir.join("relay"))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from("relay"));
        Self {
            program,
            args: vec![
                "session".to_string(),
                "--started-by".to_string(),
                "daemon".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub home_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub beacon_interval: Duration,
    /// 0 lets the OS pick a free port.
    pub http_port: u16,
    pub version_restart_grace: Duration,
    pub webhook_timeout: Duration,
    pub stop_grace: Duration,
    pub server: Option<ServerConfig>,
    pub session: SessionCommand,
    /// Installed binary watched for upgrades; also what gets relaunched.
    pub binary_path: PathBuf,
    pub debug_log: bool,
    /// Problems found while loading that did not fail it. Logged once
    /// logging is up.
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    daemon: DaemonSection,
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    session: SessionSection,
}

#[derive(Debug, Default, Deserialize)]
struct DaemonSection {
    heartbeat_interval_ms: Option<u64>,
    beacon_interval_ms: Option<u64>,
    http_port: Option<u16>,
    version_restart_grace_ms: Option<u64>,
    webhook_timeout_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionSection {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    machine_id: String,
}

impl DaemonConfig {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self> {
        let binary_path =
            std::env::current_exe().map_err(|err| DaemonError::io("resolve current exe", err))?;
        Self::load_with(|key| std::env::var(key).ok(), binary_path)
    }

    /// Loads configuration using `env` as the environment lookup.
    pub fn load_with<F>(env: F, binary_path: PathBuf) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home_dir = match non_empty(env(HOME_DIR_ENV)) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(DaemonError::HomeDirNotFound)?
                .join(DEFAULT_HOME_DIR_NAME),
        };

        let mut config = Self::defaults(home_dir, binary_path);
        let file = load_file_config(&config.config_path())?;

        let daemon = file.daemon;
        if let Some(ms) = daemon.heartbeat_interval_ms {
            config.heartbeat_interval = heartbeat_from_ms(ms);
        }
        if let Some(ms) = daemon.beacon_interval_ms {
            config.beacon_interval = Duration::from_millis(ms.max(MIN_HEARTBEAT_INTERVAL_MS));
        }
        if let Some(port) = daemon.http_port {
            config.http_port = port;
        }
        if let Some(ms) = daemon.version_restart_grace_ms {
            config.version_restart_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = daemon.webhook_timeout_ms {
            config.webhook_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = daemon.stop_grace_ms {
            config.stop_grace = Duration::from_millis(ms);
        }

        if let Some(program) = file.session.program {
            config.session.program = program;
            config.session.args = file.session.args.unwrap_or_default();
        } else if let Some(args) = file.session.args {
            config.session.args = args;
        }

        if let Some(raw) = non_empty(env(HEARTBEAT_INTERVAL_ENV)) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.heartbeat_interval = heartbeat_from_ms(ms),
                Err(err) => config.warnings.push(format!(
                    "Ignoring invalid {} value {:?}: {}",
                    HEARTBEAT_INTERVAL_ENV, raw, err
                )),
            }
        }

        // The beacon must fire more often than the heartbeat.
        if config.beacon_interval >= config.heartbeat_interval {
            let clamped = config.heartbeat_interval / 2;
            config.warnings.push(format!(
                "Beacon interval {}ms is not below heartbeat interval {}ms; using {}ms",
                config.beacon_interval.as_millis(),
                config.heartbeat_interval.as_millis(),
                clamped.as_millis()
            ));
            config.beacon_interval = clamped;
        }

        config.debug_log = env(DEBUG_LOG_ENV)
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false);

        let server_url = non_empty(env(SERVER_URL_ENV)).or(non_empty(file.server.url));
        if let Some(raw_url) = server_url {
            let url = Url::parse(raw_url.trim()).map_err(|err| DaemonError::InvalidServerUrl {
                url: raw_url.clone(),
                details: err.to_string(),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(DaemonError::InvalidServerUrl {
                    url: raw_url,
                    details: "scheme must be http or https".to_string(),
                });
            }
            let token = non_empty(env(TOKEN_ENV))
                .or(non_empty(file.server.token))
                .or_else(|| read_access_key(&config.access_key_path()))
                .ok_or_else(|| DaemonError::MissingToken(config.access_key_path()))?;
            config.server = Some(ServerConfig { url, token });
        }

        Ok(config)
    }

    /// Defaults rooted at `home_dir`, with no environment or file overrides.
    pub fn defaults(home_dir: PathBuf, binary_path: PathBuf) -> Self {
        Self {
            session: SessionCommand::default_for(&binary_path),
            home_dir,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            beacon_interval: Duration::from_millis(DEFAULT_BEACON_INTERVAL_MS),
            http_port: 0,
            version_restart_grace: Duration::from_millis(DEFAULT_VERSION_RESTART_GRACE_MS),
            webhook_timeout: Duration::from_millis(DEFAULT_WEBHOOK_TIMEOUT_MS),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            server: None,
            binary_path,
            debug_log: false,
            warnings: Vec::new(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.home_dir.join(CONFIG_FILE_NAME)
    }

    pub fn state_path(&self) -> PathBuf {
        self.home_dir.join(STATE_FILE_NAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home_dir.join(LOCK_FILE_NAME)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.home_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn access_key_path(&self) -> PathBuf {
        self.home_dir.join(ACCESS_KEY_FILE_NAME)
    }

    pub fn backoff_path(&self) -> PathBuf {
        self.home_dir.join(BACKOFF_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(LOGS_DIR_NAME)
    }

    /// Returns the persisted machine id, generating one on first use.
    pub fn load_or_create_machine_id(&self) -> Result<String> {
        let path = self.settings_path();
        match fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<Settings>(&data) {
                Ok(settings) if !settings.machine_id.trim().is_empty() => {
                    return Ok(settings.machine_id)
                }
                Ok(_) => tracing::warn!(path = %path.display(), "Settings had empty machineId"),
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "Settings unreadable")
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(DaemonError::io("read settings", err)),
        }

        let settings = Settings {
            machine_id: uuid::Uuid::new_v4().to_string(),
        };
        fs::create_dir_all(&self.home_dir)
            .map_err(|err| DaemonError::io("create relay home", err))?;
        let payload = serde_json::to_vec_pretty(&settings).map_err(|err| DaemonError::Json {
            context: "serialize settings".to_string(),
            source: err,
        })?;
        fs::write(&path, payload).map_err(|err| DaemonError::io("write settings", err))?;
        tracing::info!(machine_id = %settings.machine_id, "Generated machine id");
        Ok(settings.machine_id)
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(path).map_err(|err| DaemonError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })?;
    toml::from_str::<FileConfig>(&content).map_err(|err| DaemonError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn read_access_key(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        return non_empty(value.get("token")?.as_str().map(str::to_string));
    }
    non_empty(Some(trimmed.to_string()))
}

fn heartbeat_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(MIN_HEARTBEAT_INTERVAL_MS))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|candidate| !candidate.trim().is_empty())
}
