//! Worker pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for the daemon's WorkerPool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum processes stepping at once
    #[serde(rename = "max-processes", default = "default_max_processes")]
    pub max_processes: usize,

    /// How often the pool claims new launch tasks (milliseconds)
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time between two steps of one process (milliseconds)
    #[serde(rename = "step-interval-ms", default = "default_step_interval_ms")]
    pub step_interval_ms: u64,

    /// Steps until the default workload finishes; 0 runs until killed
    #[serde(default = "default_steps")]
    pub steps: u64,

    /// How long shutdown waits for runners to stop (milliseconds)
    #[serde(rename = "shutdown-timeout-ms", default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_max_processes() -> usize {
    debug!("default_max_processes: called");
    8
}

fn default_poll_interval_ms() -> u64 {
    debug!("default_poll_interval_ms: called");
    500
}

fn default_step_interval_ms() -> u64 {
    debug!("default_step_interval_ms: called");
    1_000
}

fn default_steps() -> u64 {
    debug!("default_steps: called");
    30
}

fn default_shutdown_timeout_ms() -> u64 {
    debug!("default_shutdown_timeout_ms: called");
    10_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        debug!("WorkerConfig::default: called");
        Self {
            max_processes: default_max_processes(),
            poll_interval_ms: default_poll_interval_ms(),
            step_interval_ms: default_step_interval_ms(),
            steps: default_steps(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
