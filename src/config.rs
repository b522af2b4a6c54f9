//! Runtime configuration for the sync agent.
//!
//! Resolution order: built-in defaults, then the `local_settings` table
//! (category `sync`), then `POS_SYNC_*` environment variables.

use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;

use crate::credentials::TerminalCredentials;
use crate::db;
use crate::error::{PosError, PosResult};

/// `local_settings` category holding sync overrides.
pub const SETTINGS_CATEGORY: &str = "sync";

const ENV_PREFIX: &str = "POS_SYNC_";
const ENV_DATA_DIR: &str = "POS_DATA_DIR";

const KEY_INTERVAL_SECS: &str = "interval_secs";
const KEY_MAX_BATCH_SIZE: &str = "max_batch_size";
const KEY_BACKOFF_CAP_SECS: &str = "backoff_cap_secs";
const KEY_REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";
const KEY_DRAIN_DELAY_MS: &str = "drain_delay_ms";
const KEY_HEALTH_INTERVAL_SECS: &str = "health_interval_secs";
const KEY_CONNECTIVITY_TIMEOUT_SECS: &str = "connectivity_timeout_secs";
const KEY_STATUS_LOG_INTERVAL_SECS: &str = "status_log_interval_secs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Time between regular cycles.
    pub interval: Duration,
    pub max_batch_size: usize,
    /// Upper bound of the exponential backoff.
    pub backoff_cap: Duration,
    /// Timeout around one remote batch call.
    pub request_timeout: Duration,
    /// Pause before the next cycle when a full batch drained cleanly.
    pub drain_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_batch_size: 50,
            backoff_cap: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            drain_delay: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub admin_url: String,
    pub api_key: String,
    pub terminal_id: String,
    pub request_timeout: Duration,
    pub connectivity_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(credentials: TerminalCredentials, config: &SyncConfig) -> Self {
        Self {
            admin_url: credentials.admin_url,
            api_key: credentials.api_key,
            terminal_id: credentials.terminal_id,
            request_timeout: config.dispatcher.request_timeout,
            connectivity_timeout: config.connectivity_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub dispatcher: DispatcherConfig,
    pub health_interval: Duration,
    pub connectivity_timeout: Duration,
    /// How often the agent logs a status line.
    pub status_log_interval: Duration,
}

impl SyncConfig {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            dispatcher: DispatcherConfig::default(),
            health_interval: Duration::from_secs(15),
            connectivity_timeout: Duration::from_secs(10),
            status_log_interval: Duration::from_secs(60),
        }
    }

    /// Defaults, then stored settings, then the environment.
    pub fn load(data_dir: PathBuf, conn: &Connection) -> PosResult<Self> {
        let mut config = Self::with_data_dir(data_dir);
        config.apply_overrides(|key| db::get_setting(conn, SETTINGS_CATEGORY, key))?;
        config.apply_overrides(|key| {
            std::env::var(format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())).ok()
        })?;
        Ok(config)
    }

    /// Overwrite every field `lookup` has a value for.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> PosResult<()> {
        let secs = |key: &str| parse_u64(key, lookup(key)).map(|v| v.map(Duration::from_secs));

        if let Some(v) = secs(KEY_INTERVAL_SECS)? {
            self.dispatcher.interval = v;
        }
        if let Some(v) = parse_u64(KEY_MAX_BATCH_SIZE, lookup(KEY_MAX_BATCH_SIZE))? {
            self.dispatcher.max_batch_size = usize::try_from(v)
                .map_err(|_| PosError::Config(format!("{KEY_MAX_BATCH_SIZE} is too large")))?;
        }
        if let Some(v) = secs(KEY_BACKOFF_CAP_SECS)? {
            self.dispatcher.backoff_cap = v;
        }
        if let Some(v) = secs(KEY_REQUEST_TIMEOUT_SECS)? {
            self.dispatcher.request_timeout = v;
        }
        if let Some(v) = parse_u64(KEY_DRAIN_DELAY_MS, lookup(KEY_DRAIN_DELAY_MS))? {
            self.dispatcher.drain_delay = Duration::from_millis(v);
        }
        if let Some(v) = secs(KEY_HEALTH_INTERVAL_SECS)? {
            self.health_interval = v;
        }
        if let Some(v) = secs(KEY_CONNECTIVITY_TIMEOUT_SECS)? {
            self.connectivity_timeout = v;
        }
        if let Some(v) = secs(KEY_STATUS_LOG_INTERVAL_SECS)? {
            self.status_log_interval = v;
        }
        self.validate()
    }

    fn validate(&self) -> PosResult<()> {
        let positive = [
            (KEY_INTERVAL_SECS, self.dispatcher.interval),
            (KEY_BACKOFF_CAP_SECS, self.dispatcher.backoff_cap),
            (KEY_REQUEST_TIMEOUT_SECS, self.dispatcher.request_timeout),
            (KEY_HEALTH_INTERVAL_SECS, self.health_interval),
            (KEY_CONNECTIVITY_TIMEOUT_SECS, self.connectivity_timeout),
            (KEY_STATUS_LOG_INTERVAL_SECS, self.status_log_interval),
        ];
        for (key, value) in positive {
            if value.is_zero() {
                return Err(PosError::Config(format!("{key} must be greater than zero")));
            }
        }
        if self.dispatcher.max_batch_size == 0 {
            return Err(PosError::Config(format!(
                "{KEY_MAX_BATCH_SIZE} must be at least 1"
            )));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: Option<String>) -> PosResult<Option<u64>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| PosError::Config(format!("{key}: expected a whole number, got {raw:?}")))
}

/// Data directory: `POS_DATA_DIR` when set, else the per-user app data dir.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var(ENV_DATA_DIR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_data_dir)
}

pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos")
}
