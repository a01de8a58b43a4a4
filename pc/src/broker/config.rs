//! Broker configuration

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Channel buffer size for broker requests
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Channel buffer size for per-process RPC subscriptions
    #[serde(rename = "worker-channel-buffer", default = "default_worker_channel_buffer")]
    pub worker_channel_buffer: usize,
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_worker_channel_buffer() -> usize {
    debug!("default_worker_channel_buffer: called");
    32
}

impl Default for BrokerConfig {
    fn default() -> Self {
        debug!("BrokerConfig::default: called");
        Self {
            channel_buffer: default_channel_buffer(),
            worker_channel_buffer: default_worker_channel_buffer(),
        }
    }
}
