//! Process registry with actor pattern
//!
//! RegistryManager owns the SQLite-backed ProcessStore and processes
//! commands via channels. The control plane only reads it through the
//! ProcessRegistry trait; workers mutate it through the manager handle.

mod manager;
mod messages;
mod store;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::domain::{ProcessHandle, ProcessId};

pub use manager::RegistryManager;
pub use messages::{RegistryCommand, RegistryError, RegistryResponse};
pub use store::{ProcessFilter, ProcessStore};

/// Access to the durable process registry
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Ids of all non-terminal processes, optionally filtered on the paused flag
    ///
    /// The result is a point-in-time snapshot.
    async fn active_processes(&self, paused: Option<bool>) -> RegistryResponse<BTreeSet<ProcessId>>;

    /// Look up a single process
    async fn get(&self, id: ProcessId) -> RegistryResponse<Option<ProcessHandle>>;

    /// Record a new process in the `Created` state
    async fn create(&self, label: Option<String>) -> RegistryResponse<ProcessHandle>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::debug;

    use crate::domain::ProcessState;

    /// In-memory registry for unit tests
    #[derive(Default)]
    pub struct MockRegistry {
        processes: Mutex<BTreeMap<ProcessId, ProcessHandle>>,
        fail: bool,
        queries: AtomicUsize,
    }

    impl MockRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        /// A registry whose queries always fail
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn with(self, id: u64, state: ProcessState, paused: bool) -> Self {
            let process = ProcessHandle::new(id).with_state(state).with_paused(paused);
            self.processes.lock().unwrap().insert(process.id, process);
            self
        }

        /// Several running, unpaused processes
        pub fn running(ids: &[u64]) -> Self {
            ids.iter()
                .fold(Self::new(), |registry, id| registry.with(*id, ProcessState::Running, false))
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessRegistry for MockRegistry {
        async fn active_processes(&self, paused: Option<bool>) -> RegistryResponse<BTreeSet<ProcessId>> {
            debug!(?paused, "MockRegistry::active_processes: called");
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RegistryError::StoreError("registry unavailable".to_string()));
            }
            Ok(self
                .processes
                .lock()
                .unwrap()
                .values()
                .filter(|p| p.is_active())
                .filter(|p| paused.is_none_or(|want| p.paused == want))
                .map(|p| p.id)
                .collect())
        }

        async fn get(&self, id: ProcessId) -> RegistryResponse<Option<ProcessHandle>> {
            debug!(%id, "MockRegistry::get: called");
            self.queries.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RegistryError::StoreError("registry unavailable".to_string()));
            }
            Ok(self.processes.lock().unwrap().get(&id).cloned())
        }

        async fn create(&self, label: Option<String>) -> RegistryResponse<ProcessHandle> {
            debug!(?label, "MockRegistry::create: called");
            let mut processes = self.processes.lock().unwrap();
            let next = processes.keys().next_back().map_or(1, |id| id.as_u64() + 1);
            let mut process = ProcessHandle::new(next);
            process.label = label;
            processes.insert(process.id, process.clone());
            Ok(process)
        }
    }
}
