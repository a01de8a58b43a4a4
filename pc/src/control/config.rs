//! Control-plane configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Timeouts and defaults for control actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// How long a waiting batch tolerates no progress (milliseconds)
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long a single RPC call waits for the worker's answer (milliseconds)
    #[serde(rename = "rpc-timeout-ms", default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Wait for scheduled actions unless the command line says otherwise
    #[serde(default)]
    pub wait: bool,
}

fn default_timeout_ms() -> u64 {
    debug!("default_timeout_ms: called");
    5_000
}

fn default_rpc_timeout_ms() -> u64 {
    debug!("default_rpc_timeout_ms: called");
    5_000
}

impl Default for ControlConfig {
    fn default() -> Self {
        debug!("ControlConfig::default: called");
        Self {
            timeout_ms: default_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            wait: false,
        }
    }
}

impl ControlConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControlConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert!(!config.wait);
    }

    #[test]
    fn test_yaml_keys() {
        let config: ControlConfig = serde_yaml::from_str("timeout-ms: 100\nwait: true").unwrap();
        assert_eq!(config.timeout_ms, 100);
        assert_eq!(config.rpc_timeout_ms, 5_000);
        assert!(config.wait);
    }
}
