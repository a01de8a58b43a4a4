//! Daemon-side execution of launched processes
//!
//! The WorkerPool claims launch tasks from the broker and gives each one a
//! ProcessRunner. Runners are the RPC owners that control calls reach.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::registry::RegistryError;

pub mod config;
pub mod pool;
pub mod runner;
pub mod workload;

pub use config::WorkerConfig;
pub use pool::WorkerPool;
pub use runner::{ProcessRunner, RunnerExit};
pub use workload::{StepOutcome, TickWorkload, Workload};

/// Errors raised while running processes
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}
