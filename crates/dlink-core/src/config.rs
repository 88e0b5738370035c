//! Link configuration.
//!
//! Read from a JSON file with camelCase keys. Every field has a default, so a
//! partial (or empty) file is valid.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_CACHE_TTL_MS, DEFAULT_SWEEP_INTERVAL_MS};
use crate::progress::DEFAULT_PROGRESS_DEBOUNCE_MS;

/// Tunables for the listing cache, progress debouncing, and downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// How long a directory listing stays valid (default: 30 000)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
    /// How often expired listings are purged (default: 60 000)
    #[serde(default = "default_sweep_interval")]
    pub cache_sweep_interval_ms: u64,
    /// Minimum gap between forwarded progress updates per device (default: 50)
    #[serde(default = "default_progress_debounce")]
    pub progress_debounce_ms: u64,
    /// Where downloads land. Falls back to the system download directory.
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
            cache_sweep_interval_ms: default_sweep_interval(),
            progress_debounce_ms: default_progress_debounce(),
            download_dir: None,
        }
    }
}

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_MS
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

fn default_progress_debounce() -> u64 {
    DEFAULT_PROGRESS_DEBOUNCE_MS
}

impl LinkConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn progress_debounce(&self) -> Duration {
        Duration::from_millis(self.progress_debounce_ms)
    }

    /// The configured download directory, or the user's Downloads folder.
    pub fn resolve_download_dir(&self) -> Option<PathBuf> {
        self.download_dir.clone().or_else(dirs::download_dir)
    }
}

/// A config file that exists but couldn't be read or parsed.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid config at {}: {}", self.path.display(), self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Loads the config from a JSON file.
pub fn load_config(path: &Path) -> Result<LinkConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|e| ConfigError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Loads the config, returning defaults if the file is missing or invalid.
pub fn load_config_or_default(path: &Path) -> LinkConfig {
    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return LinkConfig::default();
    }
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}, using defaults", e);
            LinkConfig::default()
        }
    }
}
