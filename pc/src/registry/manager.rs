//! RegistryManager - actor that owns the ProcessStore
//!
//! Processes commands via channels for thread-safe access to the registry.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::domain::{ProcessHandle, ProcessId, ProcessState};

use super::ProcessRegistry;
use super::messages::{RegistryCommand, RegistryError, RegistryResponse};
use super::store::{ProcessFilter, ProcessStore};

/// Handle to send commands to the RegistryManager
#[derive(Clone)]
pub struct RegistryManager {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryManager {
    /// Spawn a new RegistryManager actor over the store in `dir`
    pub fn spawn(dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(dir = %dir.as_ref().display(), "spawn: called");
        let store = ProcessStore::open(dir.as_ref())?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));

        info!("RegistryManager spawned");
        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<RegistryResponse<T>>) -> RegistryCommand,
    ) -> RegistryResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| RegistryError::ChannelError)?;
        reply_rx.await.map_err(|_| RegistryError::ChannelError)?
    }

    /// Create a process with a store-assigned id
    pub async fn create_process(&self, label: Option<String>) -> RegistryResponse<ProcessHandle> {
        debug!(?label, "create_process: called");
        self.request(|reply| RegistryCommand::Create { label, reply }).await
    }

    /// Insert a process with an explicit id
    pub async fn insert_process(&self, process: ProcessHandle) -> RegistryResponse<()> {
        debug!(id = %process.id, "insert_process: called");
        self.request(|reply| RegistryCommand::Insert { process, reply }).await
    }

    /// Get a process by id
    pub async fn get_process(&self, id: ProcessId) -> RegistryResponse<Option<ProcessHandle>> {
        debug!(%id, "get_process: called");
        self.request(|reply| RegistryCommand::Get { id, reply }).await
    }

    /// Get a process by id, returning error if not found
    pub async fn get_process_required(&self, id: ProcessId) -> RegistryResponse<ProcessHandle> {
        debug!(%id, "get_process_required: called");
        self.get_process(id).await?.ok_or(RegistryError::NotFound(id))
    }

    /// Overwrite a process
    pub async fn update_process(&self, process: ProcessHandle) -> RegistryResponse<()> {
        debug!(id = %process.id, state = %process.state, paused = process.paused, "update_process: called");
        self.request(|reply| RegistryCommand::Update { process, reply }).await
    }

    /// List processes matching a filter
    pub async fn list_processes(&self, filter: ProcessFilter) -> RegistryResponse<Vec<ProcessHandle>> {
        debug!(?filter, "list_processes: called");
        self.request(|reply| RegistryCommand::List { filter, reply }).await
    }

    /// Load, mutate and store a process in one call
    pub async fn modify_process(
        &self,
        id: ProcessId,
        f: impl FnOnce(&mut ProcessHandle),
    ) -> RegistryResponse<ProcessHandle> {
        debug!(%id, "modify_process: called");
        let mut process = self.get_process_required(id).await?;
        f(&mut process);
        self.update_process(process.clone()).await?;
        Ok(process)
    }

    /// Transition a process to a new state
    pub async fn set_state(&self, id: ProcessId, state: ProcessState) -> RegistryResponse<ProcessHandle> {
        debug!(%id, %state, "set_state: called");
        self.modify_process(id, |p| p.set_state(state)).await
    }

    /// Shutdown the RegistryManager
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        debug!("shutdown: called");
        self.tx
            .send(RegistryCommand::Shutdown)
            .await
            .map_err(|_| RegistryError::ChannelError)
    }
}

#[async_trait]
impl ProcessRegistry for RegistryManager {
    async fn active_processes(&self, paused: Option<bool>) -> RegistryResponse<BTreeSet<ProcessId>> {
        debug!(?paused, "active_processes: called");
        let processes = self.list_processes(ProcessFilter::active(paused)).await?;
        Ok(processes.into_iter().map(|p| p.id).collect())
    }

    async fn get(&self, id: ProcessId) -> RegistryResponse<Option<ProcessHandle>> {
        self.get_process(id).await
    }

    async fn create(&self, label: Option<String>) -> RegistryResponse<ProcessHandle> {
        self.create_process(label).await
    }
}

/// The actor loop that owns the ProcessStore and processes commands
async fn actor_loop(mut store: ProcessStore, mut rx: mpsc::Receiver<RegistryCommand>) {
    debug!("RegistryManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RegistryCommand::Create { label, reply } => {
                debug!(?label, "actor_loop: Create command");
                let result = store.create(label).map_err(|e| RegistryError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            RegistryCommand::Insert { process, reply } => {
                debug!(id = %process.id, "actor_loop: Insert command");
                let result = store
                    .insert(&process)
                    .map_err(|e| RegistryError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            RegistryCommand::Get { id, reply } => {
                debug!(%id, "actor_loop: Get command");
                let result = store.get(id).map_err(|e| RegistryError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            RegistryCommand::Update { process, reply } => {
                debug!(id = %process.id, "actor_loop: Update command");
                let result = match store.update(&process) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(RegistryError::NotFound(process.id)),
                    Err(e) => Err(RegistryError::StoreError(e.to_string())),
                };
                let _ = reply.send(result);
            }

            RegistryCommand::List { filter, reply } => {
                debug!(?filter, "actor_loop: List command");
                let result = store.list(&filter).map_err(|e| RegistryError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }

            RegistryCommand::Shutdown => {
                info!("RegistryManager shutting down");
                break;
            }
        }
    }

    debug!("RegistryManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_registry_crud() {
        let temp = tempdir().unwrap();
        let manager = RegistryManager::spawn(temp.path()).unwrap();

        let created = manager.create_process(Some("demo".to_string())).await.unwrap();
        let retrieved = manager.get_process(created.id).await.unwrap().unwrap();
        assert_eq!(retrieved.label.as_deref(), Some("demo"));

        let updated = manager.set_state(created.id, ProcessState::Running).await.unwrap();
        assert_eq!(updated.state, ProcessState::Running);

        let all = manager.list_processes(ProcessFilter::all()).await.unwrap();
        assert_eq!(all.len(), 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_active_processes_snapshot() {
        let temp = tempdir().unwrap();
        let manager = RegistryManager::spawn(temp.path()).unwrap();

        manager
            .insert_process(ProcessHandle::new(1).with_state(ProcessState::Running))
            .await
            .unwrap();
        manager
            .insert_process(ProcessHandle::new(2).with_state(ProcessState::Waiting).with_paused(true))
            .await
            .unwrap();
        manager
            .insert_process(ProcessHandle::new(3).with_state(ProcessState::Excepted))
            .await
            .unwrap();

        let active = manager.active_processes(None).await.unwrap();
        assert_eq!(active, BTreeSet::from([ProcessId(1), ProcessId(2)]));

        let paused = manager.active_processes(Some(true)).await.unwrap();
        assert_eq!(paused, BTreeSet::from([ProcessId(2)]));

        let running = manager.active_processes(Some(false)).await.unwrap();
        assert_eq!(running, BTreeSet::from([ProcessId(1)]));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_nonexistent_is_not_found() {
        let temp = tempdir().unwrap();
        let manager = RegistryManager::spawn(temp.path()).unwrap();

        let result = manager.update_process(ProcessHandle::new(42)).await;
        assert!(matches!(result, Err(RegistryError::NotFound(ProcessId(42)))));

        let result = manager.get_process_required(ProcessId(42)).await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail_with_channel_error() {
        let temp = tempdir().unwrap();
        let manager = RegistryManager::spawn(temp.path()).unwrap();
        manager.shutdown().await.unwrap();

        // Give the actor a moment to drop its receiver
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = manager.get_process(ProcessId(1)).await;
        assert!(matches!(result, Err(RegistryError::ChannelError)));
    }
}
