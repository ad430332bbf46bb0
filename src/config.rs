//! Runtime configuration: defaults overridden by `INTERVENTION_SYNC_*`
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::sync::{SyncSettings, DEFAULT_STALENESS_THRESHOLD};

const APP_DIR_NAME: &str = "com.hotel.interventions";

const ENV_DATA_DIR: &str = "INTERVENTION_SYNC_DATA_DIR";
const ENV_LOG_DIR: &str = "INTERVENTION_SYNC_LOG_DIR";
const ENV_USER_ID: &str = "INTERVENTION_SYNC_USER_ID";
const ENV_INTERVAL: &str = "INTERVENTION_SYNC_INTERVAL_SECS";
const ENV_STALE_AFTER: &str = "INTERVENTION_SYNC_STALE_AFTER_SECS";
const ENV_DEAD_LETTER: &str = "INTERVENTION_SYNC_DEAD_LETTER";
const ENV_CONNECTION_STRING: &str = "INTERVENTION_SYNC_CONNECTION_STRING";
const ENV_LOG_JSON: &str = "INTERVENTION_SYNC_LOG_JSON";

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Technician the background loop syncs for.
    pub user_id: Option<String>,
    pub sync_interval_secs: u64,
    pub staleness_threshold_secs: u64,
    pub dead_letter_permanent_failures: bool,
    /// Overrides the keyring credentials when set.
    pub connection_string: Option<String>,
    pub log_json: bool,
}

/// Per-user application data directory.
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
    base.join(APP_DIR_NAME)
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            log_dir: data_dir.join("logs"),
            data_dir,
            user_id: None,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            staleness_threshold_secs: DEFAULT_STALENESS_THRESHOLD.as_secs(),
            dead_letter_permanent_failures: false,
            connection_string: None,
            log_json: false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(name: &str) -> Result<Option<u64>, String> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| format!("{name}: expected a whole number of seconds, got {raw:?}: {e}")),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, String> {
    match env_string(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(format!("{name}: expected true or false, got {v:?}")),
        },
    }
}

impl SyncConfig {
    /// Defaults, then environment overrides. A log dir that is not set
    /// explicitly follows the data dir.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(dir) = env_string(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
            config.log_dir = config.data_dir.join("logs");
        }
        if let Some(dir) = env_string(ENV_LOG_DIR) {
            config.log_dir = PathBuf::from(dir);
        }
        config.user_id = env_string(ENV_USER_ID);
        if let Some(secs) = env_u64(ENV_INTERVAL)? {
            if secs == 0 {
                return Err(format!("{ENV_INTERVAL}: must be at least 1 second"));
            }
            config.sync_interval_secs = secs;
        }
        if let Some(secs) = env_u64(ENV_STALE_AFTER)? {
            config.staleness_threshold_secs = secs;
        }
        if let Some(flag) = env_bool(ENV_DEAD_LETTER)? {
            config.dead_letter_permanent_failures = flag;
        }
        config.connection_string = env_string(ENV_CONNECTION_STRING);
        if let Some(flag) = env_bool(ENV_LOG_JSON)? {
            config.log_json = flag;
        }
        Ok(config)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            staleness_threshold: Duration::from_secs(self.staleness_threshold_secs),
            dead_letter_permanent_failures: self.dead_letter_permanent_failures,
        }
    }
}
