//! Reconciliation between the process registry and the launch queue
//!
//! Every active process should have exactly one outstanding launch task.
//! `inspect` reports where that does not hold; `repair` fixes it, and may
//! only run while no worker consumes the queue.

mod report;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{ExclusiveQueueGuard, TaskQueue};
use crate::domain::{DeliveryTag, ProcessId};
use crate::registry::ProcessRegistry;

pub use report::{ReconcileError, ReconciliationReport, Snapshot, classify};

/// Result of a repair run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Anomalies found before repairing
    pub report: ReconciliationReport,
    /// Tasks acknowledged without execution
    pub discarded: Vec<DeliveryTag>,
    /// Processes that got a fresh continue task
    pub revived: Vec<ProcessId>,
}

/// Diffs the registry against the launch queue
pub struct Reconciler {
    registry: Arc<dyn ProcessRegistry>,
    queue: Arc<dyn TaskQueue>,
}

impl Reconciler {
    pub fn new(registry: Arc<dyn ProcessRegistry>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { registry, queue }
    }

    /// Take both snapshots; fails without side effects
    pub async fn collect(&self) -> Result<Snapshot, ReconcileError> {
        debug!("Reconciler::collect: called");
        let active = self
            .registry
            .active_processes(None)
            .await
            .map_err(ReconcileError::registry)?;
        let tasks = self.queue.list_tasks().await.map_err(ReconcileError::queue)?;
        debug!(active = active.len(), tasks = tasks.len(), "Reconciler::collect: snapshots taken");
        Ok(Snapshot::new(active, &tasks))
    }

    /// Report anomalies; never mutates anything
    pub async fn inspect(&self) -> Result<ReconciliationReport, ReconcileError> {
        debug!("Reconciler::inspect: called");
        let report = classify(&self.collect().await?);
        info!(
            consistent = report.is_consistent(),
            duplicates = report.duplicates.len(),
            orphans = report.orphans.len(),
            zombies = report.zombies.len(),
            "Reconciliation inspected"
        );
        Ok(report)
    }

    /// Discard duplicate and orphaned tasks, then revive zombies
    ///
    /// The guard proves no worker is consuming the queue. Each step is
    /// idempotent, so rerunning after a failure converges.
    pub async fn repair(&self, _guard: &ExclusiveQueueGuard) -> Result<RepairOutcome, ReconcileError> {
        debug!("Reconciler::repair: called");
        let snapshot = self.collect().await?;
        let report = classify(&snapshot);

        let mut discarded = Vec::new();
        for id in &report.duplicates {
            if report.orphans.contains(id) {
                continue;
            }
            if let Some(tags) = snapshot.handles.get(id) {
                for tag in tags.iter().skip(1) {
                    self.queue.discard(*tag).await?;
                    info!(pid = %id, %tag, "Discarded duplicate task");
                    discarded.push(*tag);
                }
            }
        }
        for id in &report.orphans {
            if let Some(tags) = snapshot.handles.get(id) {
                for tag in tags {
                    self.queue.discard(*tag).await?;
                    info!(pid = %id, %tag, "Discarded orphaned task");
                    discarded.push(*tag);
                }
            }
        }

        let mut revived = Vec::new();
        for id in &report.zombies {
            match self.queue.publish(*id).await {
                Ok(tag) => {
                    info!(pid = %id, %tag, "Revived process without a task");
                    revived.push(*id);
                }
                Err(e) => {
                    warn!(pid = %id, error = %e, "Failed to revive process");
                    return Err(ReconcileError::Repair(e));
                }
            }
        }

        Ok(RepairOutcome {
            report,
            discarded,
            revived,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueLock;
    use crate::broker::mock::MockQueue;
    use crate::registry::mock::MockRegistry;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_inspect_is_read_only() {
        let queue = Arc::new(MockQueue::with_tasks(&[2, 2, 4]));
        let reconciler = Reconciler::new(Arc::new(MockRegistry::running(&[1, 2, 3])), queue.clone());

        let before = queue.snapshot();
        let first = reconciler.inspect().await.unwrap();
        let second = reconciler.inspect().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.snapshot(), before);
    }

    #[tokio::test]
    async fn test_repair_converges() {
        let temp = tempdir().unwrap();
        let guard = QueueLock::new(temp.path()).exclusive().unwrap();

        // Two tasks for 7, an orphan for 9, nothing for 3
        let queue = Arc::new(MockQueue::with_tasks(&[7, 7, 9]));
        let reconciler = Reconciler::new(Arc::new(MockRegistry::running(&[3, 7])), queue.clone());

        let outcome = reconciler.repair(&guard).await.unwrap();
        assert_eq!(outcome.discarded.len(), 2);
        assert_eq!(outcome.revived, vec![ProcessId(3)]);
        assert!(!outcome.report.is_consistent());

        assert!(reconciler.inspect().await.unwrap().is_consistent());

        // A second repair has nothing to do
        let again = reconciler.repair(&guard).await.unwrap();
        assert!(again.discarded.is_empty());
        assert!(again.revived.is_empty());
    }

    #[tokio::test]
    async fn test_collection_failure_is_fatal_and_harmless() {
        let queue = Arc::new(MockQueue::with_tasks(&[1]));
        let reconciler = Reconciler::new(Arc::new(MockRegistry::failing()), queue.clone());

        let result = reconciler.inspect().await;
        assert!(matches!(result, Err(ReconcileError::Collection { source_name: "registry", .. })));
        assert_eq!(queue.snapshot().len(), 1);

        let reconciler = Reconciler::new(Arc::new(MockRegistry::running(&[1])), Arc::new(MockQueue::failing()));
        let result = reconciler.inspect().await;
        assert!(matches!(result, Err(ReconcileError::Collection { source_name: "launch queue", .. })));
    }
}
