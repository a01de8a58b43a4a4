//! procctl configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;
use crate::control::ControlConfig;
use crate::worker::WorkerConfig;

/// Main procctl configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the registry, queue and daemon files live
    pub storage: StorageConfig,

    /// Control command defaults
    pub control: ControlConfig,

    /// Broker channel sizing
    pub broker: BrokerConfig,

    /// Daemon worker pool
    pub worker: WorkerConfig,

    /// Log level used when --log-level is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .procctl.yml
        let local_config = PathBuf::from(".procctl.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/procctl/procctl.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("procctl").join("procctl.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding registry.db, queue.db, the queue lock and daemon files
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/procctl on Linux)
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("procctl"))
            .unwrap_or_else(|| PathBuf::from(".procctl"));
        Self { data_dir }
    }
}

/// Directory for the log file (~/.local/share/procctl/logs)
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("procctl").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".procctl/logs"))
}
