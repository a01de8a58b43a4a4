//! WorkerPool - claims launch tasks and runs their processes

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerHandle;
use crate::domain::{DeliveryTag, ProcessId, ProcessState, TaskPayload};
use crate::registry::RegistryManager;

use super::WorkerError;
use super::config::WorkerConfig;
use super::runner::{ProcessRunner, RunnerExit};
use super::workload::Workload;

type RunnerJoin = Result<Result<RunnerExit, WorkerError>, JoinError>;

struct RunningProcess {
    tag: DeliveryTag,
    handle: JoinHandle<Result<RunnerExit, WorkerError>>,
}

/// Consumes the launch queue inside the daemon
pub struct WorkerPool {
    config: WorkerConfig,
    registry: RegistryManager,
    broker: BrokerHandle,
    workload: Arc<dyn Workload>,
    consumer: String,
    running: HashMap<ProcessId, RunningProcess>,
    stop_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        registry: RegistryManager,
        broker: BrokerHandle,
        workload: Arc<dyn Workload>,
    ) -> Self {
        let consumer = format!("worker-{}", Uuid::now_v7());
        debug!(%consumer, "WorkerPool::new: called");
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            broker,
            workload,
            consumer,
            running: HashMap::new(),
            stop_tx,
        }
    }

    /// Consumer name this pool claims tasks under
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Poll the queue until shutdown is signalled, then stop every runner
    pub async fn run(&mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), WorkerError> {
        info!(
            consumer = %self.consumer,
            max_processes = self.config.max_processes,
            "WorkerPool started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap_finished_runners().await;
                    if let Err(e) = self.claim_tasks().await {
                        error!(error = %e, "Failed to claim launch tasks");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("WorkerPool received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Start runners for ready tasks up to the concurrency limit
    pub async fn claim_tasks(&mut self) -> Result<usize, WorkerError> {
        let mut started = 0;
        while self.running.len() < self.config.max_processes {
            let Some(task) = self.broker.claim(&self.consumer).await? else {
                break;
            };

            let payload = match TaskPayload::decode(&task.body) {
                Ok(payload) if payload.task == "continue" => payload,
                Ok(payload) => {
                    warn!(tag = %task.tag, task = %payload.task, "Unknown launch task kind, acknowledging");
                    self.broker.ack(task.tag).await?;
                    continue;
                }
                Err(e) => {
                    warn!(tag = %task.tag, error = %e, "Malformed launch task, acknowledging");
                    self.broker.ack(task.tag).await?;
                    continue;
                }
            };

            if let Some(existing) = self.running.get(&payload.pid) {
                warn!(
                    pid = %payload.pid,
                    tag = %task.tag,
                    running_tag = %existing.tag,
                    "Duplicate launch task for running process, acknowledging"
                );
                self.broker.ack(task.tag).await?;
                continue;
            }

            self.spawn_runner(payload.pid, task.tag);
            started += 1;
        }

        if started > 0 {
            debug!(started, running = self.running.len(), "claim_tasks: started runners");
        }
        Ok(started)
    }

    fn spawn_runner(&mut self, pid: ProcessId, tag: DeliveryTag) {
        info!(%pid, %tag, "Starting process");
        let runner = ProcessRunner::new(
            pid,
            tag,
            self.registry.clone(),
            self.broker.clone(),
            self.workload.clone(),
            self.config.step_interval(),
            self.stop_tx.subscribe(),
        );
        let handle = tokio::spawn(runner.run());
        self.running.insert(pid, RunningProcess { tag, handle });
    }

    /// Remove runners that have exited
    async fn reap_finished_runners(&mut self) {
        let finished: Vec<ProcessId> = self
            .running
            .iter()
            .filter(|(_, running)| running.handle.is_finished())
            .map(|(pid, _)| *pid)
            .collect();

        for pid in finished {
            if let Some(running) = self.running.remove(&pid) {
                let joined = running.handle.await;
                self.settle_exit(pid, running.tag, joined).await;
            }
        }
    }

    /// Make sure a failed runner's task does not stay claimed by this pool
    ///
    /// A runner that returned an error left the process active, so its task
    /// goes back to ready and is claimed again. A panicked runner marks the
    /// process excepted and consumes the task.
    async fn settle_exit(&self, pid: ProcessId, tag: DeliveryTag, joined: RunnerJoin) {
        match joined {
            Ok(Ok(exit)) => debug!(%pid, %tag, ?exit, "Runner exited"),
            Ok(Err(e)) => {
                error!(%pid, %tag, error = %e, "Runner failed, releasing its task");
                self.release_task(pid, tag).await;
            }
            Err(e) if e.is_panic() => {
                error!(%pid, %tag, error = %e, "Runner panicked");
                let reason = format!("process runner panicked: {e}");
                let marked = self
                    .registry
                    .modify_process(pid, |p| {
                        p.set_state(ProcessState::Excepted);
                        p.set_status_message(Some(reason));
                    })
                    .await;
                match marked {
                    Ok(_) => {
                        if let Err(e) = self.broker.ack(tag).await {
                            error!(%pid, %tag, error = %e, "Failed to acknowledge task of panicked runner");
                        }
                    }
                    Err(e) => {
                        warn!(%pid, error = %e, "Failed to mark process excepted");
                        self.release_task(pid, tag).await;
                    }
                }
            }
            Err(e) => {
                warn!(%pid, %tag, error = %e, "Runner cancelled, releasing its task");
                self.release_task(pid, tag).await;
            }
        }
    }

    async fn release_task(&self, pid: ProcessId, tag: DeliveryTag) {
        match self.broker.release_task(tag).await {
            Ok(true) => info!(%pid, %tag, "Released task for another attempt"),
            Ok(false) => debug!(%pid, %tag, "Task was no longer held"),
            Err(e) => error!(%pid, %tag, error = %e, "Failed to release task"),
        }
    }

    /// Stop all runners, then hand back tasks this pool still holds
    pub async fn shutdown(&mut self) -> Result<(), WorkerError> {
        info!(running = self.running.len(), "WorkerPool shutting down");
        let _ = self.stop_tx.send(true);

        let deadline = Instant::now() + self.config.shutdown_timeout();
        let runners: Vec<(ProcessId, RunningProcess)> = self.running.drain().collect();
        for (pid, mut running) in runners {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut running.handle).await {
                Ok(joined) => self.settle_exit(pid, running.tag, joined).await,
                Err(_) => {
                    warn!(%pid, "Runner did not stop in time, aborting");
                    running.handle.abort();
                }
            }
        }

        let released = self.broker.release(&self.consumer).await?;
        info!(released, "WorkerPool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use crate::domain::ProcessHandle;
    use crate::worker::workload::{StepOutcome, TickWorkload};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config(max_processes: usize) -> WorkerConfig {
        WorkerConfig {
            max_processes,
            poll_interval_ms: 10,
            step_interval_ms: 10,
            steps: 0,
            shutdown_timeout_ms: 1_000,
        }
    }

    async fn setup(max_processes: usize) -> (TempDir, RegistryManager, BrokerHandle, WorkerPool) {
        let temp = TempDir::new().unwrap();
        let registry = RegistryManager::spawn(temp.path()).unwrap();
        let broker = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();
        let pool = WorkerPool::new(
            fast_config(max_processes),
            registry.clone(),
            broker.clone(),
            Arc::new(TickWorkload::new(0)),
        );
        (temp, registry, broker, pool)
    }

    async fn publish(registry: &RegistryManager, broker: &BrokerHandle) -> ProcessId {
        let process = registry.create_process(None).await.unwrap();
        let body = TaskPayload::continue_process(process.id).encode().unwrap();
        broker.publish_body(body).await.unwrap();
        process.id
    }

    #[tokio::test]
    async fn test_claim_respects_max_processes() {
        let (_temp, registry, broker, mut pool) = setup(2).await;
        for _ in 0..3 {
            publish(&registry, &broker).await;
        }

        assert_eq!(pool.claim_tasks().await.unwrap(), 2);
        assert_eq!(pool.running_count(), 2);

        let tasks = broker.queued_tasks().await.unwrap();
        let held = tasks.iter().filter(|t| t.consumer.as_deref() == Some(pool.consumer())).count();
        assert_eq!(held, 2);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_and_duplicate_tasks_are_acknowledged() {
        let (_temp, registry, broker, mut pool) = setup(4).await;
        let pid = publish(&registry, &broker).await;
        broker
            .publish_body(TaskPayload::continue_process(pid).encode().unwrap())
            .await
            .unwrap();
        broker.publish_body("not json".to_string()).await.unwrap();

        assert_eq!(pool.claim_tasks().await.unwrap(), 1);
        assert_eq!(broker.queued_tasks().await.unwrap().len(), 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_held_tasks() {
        let (_temp, registry, broker, mut pool) = setup(4).await;
        let pid = publish(&registry, &broker).await;
        pool.claim_tasks().await.unwrap();

        pool.shutdown().await.unwrap();

        let tasks = broker.queued_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].consumer, None);
        let process = registry.get_process_required(pid).await.unwrap();
        assert_eq!(process.state, ProcessState::Running);
    }

    #[tokio::test]
    async fn test_run_loop_finishes_processes() {
        let temp = TempDir::new().unwrap();
        let registry = RegistryManager::spawn(temp.path()).unwrap();
        let broker = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();
        let mut config = fast_config(4);
        config.steps = 2;
        let mut pool = WorkerPool::new(config, registry.clone(), broker.clone(), Arc::new(TickWorkload::new(2)));
        let pid = publish(&registry, &broker).await;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let pool_task = tokio::spawn(async move { pool.run(shutdown_rx).await });

        let mut finished = false;
        for _ in 0..200 {
            if registry.get_process_required(pid).await.unwrap().state == ProcessState::Finished {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished);

        shutdown_tx.send(()).await.unwrap();
        pool_task.await.unwrap().unwrap();
        assert!(broker.queued_tasks().await.unwrap().is_empty());
    }

    struct PanickingWorkload;

    #[async_trait]
    impl Workload for PanickingWorkload {
        async fn step(&self, _process: &ProcessHandle, _step: u64) -> Result<StepOutcome, String> {
            panic!("workload bug");
        }
    }

    async fn reap_until_idle(pool: &mut WorkerPool) {
        for _ in 0..200 {
            pool.reap_finished_runners().await;
            if pool.running_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("runners never exited");
    }

    #[tokio::test]
    async fn test_failed_runner_returns_its_task_to_ready() {
        let (_temp, registry, broker, mut pool) = setup(4).await;
        let pid = publish(&registry, &broker).await;
        pool.claim_tasks().await.unwrap();

        for _ in 0..200 {
            if registry.get_process_required(pid).await.unwrap().state == ProcessState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The next step cannot read the registry, so the runner errors out
        registry.shutdown().await.unwrap();
        reap_until_idle(&mut pool).await;

        let tasks = broker.queued_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].consumer, None);

        // Claimable again by any consumer
        let reclaimed = broker.claim("worker-next").await.unwrap().unwrap();
        assert_eq!(reclaimed.tag, tasks[0].tag);
    }

    #[tokio::test]
    async fn test_panicked_runner_marks_process_excepted() {
        let temp = TempDir::new().unwrap();
        let registry = RegistryManager::spawn(temp.path()).unwrap();
        let broker = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();
        let mut pool = WorkerPool::new(fast_config(4), registry.clone(), broker.clone(), Arc::new(PanickingWorkload));
        let pid = publish(&registry, &broker).await;

        pool.claim_tasks().await.unwrap();
        reap_until_idle(&mut pool).await;

        let process = registry.get_process_required(pid).await.unwrap();
        assert_eq!(process.state, ProcessState::Excepted);
        assert!(process.status_message.unwrap().contains("panicked"));
        assert!(broker.queued_tasks().await.unwrap().is_empty());

        pool.shutdown().await.unwrap();
    }
}
