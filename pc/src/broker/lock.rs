//! Advisory lock over the launch queue
//!
//! A consuming daemon holds a shared lock for its whole lifetime. Repair
//! needs the exclusive lock, so it cannot run while any consumer is alive.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::messages::BrokerError;

/// Lock file name inside the data directory
pub const QUEUE_LOCK: &str = "queue.lock";

/// Path to the queue lock file
pub struct QueueLock {
    path: PathBuf,
}

/// Held by a consumer; released on drop
#[derive(Debug)]
pub struct SharedQueueGuard {
    _file: File,
}

/// Held by repair; proves no consumer is attached to the queue
#[derive(Debug)]
pub struct ExclusiveQueueGuard {
    _file: File,
}

impl QueueLock {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(QUEUE_LOCK),
        }
    }

    fn open(&self) -> Result<File, BrokerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BrokerError::Store(e.to_string()))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| BrokerError::Store(format!("Failed to open {}: {}", self.path.display(), e)))
    }

    /// Take the shared lock without blocking
    pub fn consume(&self) -> Result<SharedQueueGuard, BrokerError> {
        debug!(path = %self.path.display(), "QueueLock::consume: called");
        let file = self.open()?;
        fs2::FileExt::try_lock_shared(&file).map_err(|_| BrokerError::QueueBusy)?;
        info!("Acquired shared queue lock");
        Ok(SharedQueueGuard { _file: file })
    }

    /// Take the exclusive lock without blocking
    ///
    /// Fails with `QueueBusy` while any consumer holds the shared lock.
    pub fn exclusive(&self) -> Result<ExclusiveQueueGuard, BrokerError> {
        debug!(path = %self.path.display(), "QueueLock::exclusive: called");
        let file = self.open()?;
        fs2::FileExt::try_lock_exclusive(&file).map_err(|_| BrokerError::QueueBusy)?;
        info!("Acquired exclusive queue lock");
        Ok(ExclusiveQueueGuard { _file: file })
    }
}
