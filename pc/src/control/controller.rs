//! ProcessController - operator-facing control operations

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::broker::{ControlChannel, TaskQueue};
use crate::domain::{DeliveryTag, ProcessAction, ProcessHandle, ProcessId, TaskRecord};
use crate::registry::ProcessRegistry;

use super::dispatcher::Dispatcher;
use super::log::ActionLog;
use super::outcome::{BatchReport, ControlError};
use super::resolver::BatchResolver;

/// Which processes an action applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    Ids(Vec<ProcessId>),
    /// Every process the action makes sense for
    All,
}

/// Waiting behavior for one batch
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub wait: bool,
    pub timeout: Duration,
}

impl WaitPolicy {
    pub fn new(wait: bool, timeout: Duration) -> Self {
        Self { wait, timeout }
    }
}

/// Kill, pause, play and revive processes under daemon supervision
pub struct ProcessController {
    registry: Arc<dyn ProcessRegistry>,
    queue: Arc<dyn TaskQueue>,
    resolver: BatchResolver,
}

impl ProcessController {
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        channel: Arc<dyn ControlChannel>,
        queue: Arc<dyn TaskQueue>,
        rpc_timeout: Duration,
    ) -> Self {
        debug!(?rpc_timeout, "ProcessController::new: called");
        let dispatcher = Dispatcher::new(registry.clone(), channel, rpc_timeout);
        Self {
            registry,
            queue,
            resolver: BatchResolver::new(dispatcher),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn ActionLog>) -> Self {
        self.resolver = self.resolver.with_log(log);
        self
    }

    async fn resolve_targets(&self, targets: Targets, paused: Option<bool>) -> Result<Vec<ProcessId>, ControlError> {
        match targets {
            Targets::Ids(ids) => Ok(ids),
            Targets::All => Ok(self.registry.active_processes(paused).await?.into_iter().collect()),
        }
    }

    /// Kill processes; `All` means every active process
    pub async fn kill(
        &self,
        targets: Targets,
        message: Option<String>,
        force: bool,
        policy: WaitPolicy,
    ) -> Result<BatchReport, ControlError> {
        debug!(?targets, ?message, force, "ProcessController::kill: called");
        let ids = self.resolve_targets(targets, None).await?;
        let action = ProcessAction::kill(message, force);
        self.resolver
            .dispatch_batch(&ids, &action, policy.wait, policy.timeout)
            .await
    }

    /// Pause processes; `All` means every active process not yet paused
    pub async fn pause(
        &self,
        targets: Targets,
        message: Option<String>,
        policy: WaitPolicy,
    ) -> Result<BatchReport, ControlError> {
        debug!(?targets, ?message, "ProcessController::pause: called");
        let ids = self.resolve_targets(targets, Some(false)).await?;
        let action = ProcessAction::pause(message);
        self.resolver
            .dispatch_batch(&ids, &action, policy.wait, policy.timeout)
            .await
    }

    /// Resume processes; `All` means every active paused process
    pub async fn play(&self, targets: Targets, policy: WaitPolicy) -> Result<BatchReport, ControlError> {
        debug!(?targets, "ProcessController::play: called");
        let ids = self.resolve_targets(targets, Some(true)).await?;
        self.resolver
            .dispatch_batch(&ids, &ProcessAction::Play, policy.wait, policy.timeout)
            .await
    }

    /// Publish a fresh continue task for each process
    ///
    /// Meant for processes that lost their task. Missing and terminal
    /// processes are skipped with a warning. A process that still has a
    /// task ends up with a duplicate, which repair removes.
    pub async fn revive(&self, ids: &[ProcessId]) -> Result<Vec<(ProcessId, DeliveryTag)>, ControlError> {
        debug!(count = ids.len(), "ProcessController::revive: called");
        let mut revived = Vec::new();
        for &pid in ids {
            match self.registry.get(pid).await? {
                None => warn!(%pid, "Not reviving Process<{pid}>: it does not exist"),
                Some(process) if process.is_terminal() => {
                    warn!(%pid, state = %process.state, "Not reviving Process<{pid}>: it is already {}", process.state);
                }
                Some(_) => {
                    let tag = self.queue.publish(pid).await?;
                    info!(%pid, %tag, "Revived Process<{pid}>");
                    revived.push((pid, tag));
                }
            }
        }
        Ok(revived)
    }

    /// Create a process and queue it for the daemon
    pub async fn launch(&self, label: Option<String>) -> Result<(ProcessHandle, DeliveryTag), ControlError> {
        debug!(?label, "ProcessController::launch: called");
        let process = self.registry.create(label).await?;
        let tag = self.queue.publish(process.id).await?;
        info!(pid = %process.id, %tag, "Launched Process<{}>", process.id);
        Ok((process, tag))
    }

    /// Snapshot of the launch queue
    pub async fn tasks(&self) -> Result<Vec<TaskRecord>, ControlError> {
        debug!("ProcessController::tasks: called");
        Ok(self.queue.list_tasks().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{MockChannel, MockQueue};
    use crate::domain::ProcessState;
    use crate::registry::mock::MockRegistry;

    fn controller(registry: MockRegistry, channel: Arc<MockChannel>, queue: Arc<MockQueue>) -> ProcessController {
        ProcessController::new(Arc::new(registry), channel, queue, Duration::from_secs(1))
    }

    fn policy() -> WaitPolicy {
        WaitPolicy::new(false, Duration::from_secs(1))
    }

    fn registry() -> MockRegistry {
        MockRegistry::new()
            .with(1, ProcessState::Running, false)
            .with(2, ProcessState::Waiting, true)
            .with(3, ProcessState::Finished, false)
    }

    #[tokio::test]
    async fn test_all_targets_per_verb() {
        let channel = Arc::new(MockChannel::new());
        let controller = controller(registry(), channel.clone(), Arc::new(MockQueue::new()));

        controller.pause(Targets::All, None, policy()).await.unwrap();
        controller.play(Targets::All, policy()).await.unwrap();
        controller.kill(Targets::All, None, false, policy()).await.unwrap();

        let calls: Vec<(u64, String)> = channel.calls().into_iter().map(|(p, v)| (p.as_u64(), v)).collect();
        assert_eq!(
            calls,
            vec![
                (1, "pause".to_string()),
                (2, "play".to_string()),
                (1, "kill".to_string()),
                (2, "kill".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_revive_skips_terminal_and_missing() {
        let queue = Arc::new(MockQueue::new());
        let controller = controller(registry(), Arc::new(MockChannel::new()), queue.clone());

        let revived = controller
            .revive(&[ProcessId(1), ProcessId(3), ProcessId(42)])
            .await
            .unwrap();

        assert_eq!(revived.len(), 1);
        assert_eq!(revived[0].0, ProcessId(1));
        assert_eq!(queue.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_creates_and_queues() {
        let queue = Arc::new(MockQueue::new());
        let controller = controller(MockRegistry::new(), Arc::new(MockChannel::new()), queue.clone());

        let (process, tag) = controller.launch(Some("job".to_string())).await.unwrap();
        assert_eq!(process.state, ProcessState::Created);

        let tasks = controller.tasks().await.unwrap();
        assert_eq!(
            tasks,
            vec![TaskRecord {
                target_id: process.id,
                delivery_tag: tag
            }]
        );
    }
}
