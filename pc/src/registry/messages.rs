//! Registry manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{ProcessHandle, ProcessId};

use super::store::ProcessFilter;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Process not found: {0}")]
    NotFound(ProcessId),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from registry operations
pub type RegistryResponse<T> = Result<T, RegistryError>;

/// Commands sent to the RegistryManager actor
#[derive(Debug)]
pub enum RegistryCommand {
    /// Create a process with a store-assigned id
    Create {
        label: Option<String>,
        reply: oneshot::Sender<RegistryResponse<ProcessHandle>>,
    },
    /// Insert a process with a caller-chosen id
    Insert {
        process: ProcessHandle,
        reply: oneshot::Sender<RegistryResponse<()>>,
    },
    Get {
        id: ProcessId,
        reply: oneshot::Sender<RegistryResponse<Option<ProcessHandle>>>,
    },
    Update {
        process: ProcessHandle,
        reply: oneshot::Sender<RegistryResponse<()>>,
    },
    List {
        filter: ProcessFilter,
        reply: oneshot::Sender<RegistryResponse<Vec<ProcessHandle>>>,
    },

    // Shutdown
    Shutdown,
}
