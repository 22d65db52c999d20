//! Daemon configuration loaded from `config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Environment overrides:
//! - `TIMEKEEP_CONFIG` - path of the config file
//! - `TIMEKEEP_SOCKET` - path of the request listener socket

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ConfigError;

/// Default listener socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/timekeep.sock";

/// Default TCP port for the listener on platforms without Unix sockets
pub const DEFAULT_LISTEN_PORT: u16 = 17_771;

/// Reconciliation sweep interval. Windows event delivery drops stop
/// notifications more often, so it sweeps twice as frequently.
#[cfg(windows)]
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
#[cfg(not(windows))]
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_POLL_GRACE: u32 = 3;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between process-table polls
    pub poll_interval_secs: u64,
    /// Consecutive missed polls before a PID counts as stopped
    pub poll_grace: u32,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Project sent with heartbeats when the program has none
    pub global_project: Option<String>,
    pub database_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub listen_port: u16,
    pub wakatime: WakaTimeConfig,
    pub wakapi: WakapiConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakaTimeConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    /// Absolute path to `wakatime-cli`; looked up on `PATH` when unset
    pub cli_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakapiConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    /// Base URL of the user's Wakapi instance
    pub server: Option<String>,
    pub cli_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            poll_grace: DEFAULT_POLL_GRACE,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            global_project: None,
            database_path: None,
            socket_path: None,
            listen_port: DEFAULT_LISTEN_PORT,
            wakatime: WakaTimeConfig::default(),
            wakapi: WakapiConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads the config from `TIMEKEEP_CONFIG` or the default location.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_file_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_grace == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_grace",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.wakatime.enabled && self.wakatime.api_key.is_none() {
            return Err(ConfigError::Invalid {
                field: "wakatime.api_key",
                reason: "required when WakaTime is enabled".to_string(),
            });
        }
        if self.wakapi.enabled && (self.wakapi.api_key.is_none() || self.wakapi.server.is_none()) {
            return Err(ConfigError::Invalid {
                field: "wakapi",
                reason: "api_key and server are required when Wakapi is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// True if any telemetry integration is enabled.
    pub fn heartbeats_enabled(&self) -> bool {
        self.wakatime.enabled || self.wakapi.enabled
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Database path: configured, else `<data_dir>/timekeep/timekeep.db`.
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("timekeep")
                .join("timekeep.db")
        })
    }

    /// Socket path: `TIMEKEEP_SOCKET`, else configured, else the default.
    pub fn socket_path(&self) -> PathBuf {
        if let Ok(path) = env::var("TIMEKEEP_SOCKET") {
            return PathBuf::from(path);
        }
        self.socket_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}

/// Returns the path of the config file.
pub fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("TIMEKEEP_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("timekeep")
        .join("config.toml")
}
