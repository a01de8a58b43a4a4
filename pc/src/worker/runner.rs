//! Drives one process on behalf of a claimed launch task
//!
//! The runner owns the process's RPC subscription while it runs. Control
//! calls that can be honoured immediately are answered `Done`; pause and
//! kill of a stepping process are accepted and take effect at the next
//! step boundary, when the deferred result is resolved.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, BrokerHandle, CallResponse, WorkerMessage};
use crate::domain::{DeliveryTag, ProcessAction, ProcessId, ProcessState};
use crate::registry::RegistryManager;

use super::WorkerError;
use super::workload::{StepOutcome, Workload};

/// Why a runner stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    Finished,
    Excepted,
    Killed,
    /// Task acknowledged without running (missing, terminal or duplicate)
    Skipped,
    /// Daemon is stopping; the task stays in the queue
    Shutdown,
}

#[derive(Debug)]
struct PendingCall {
    call_id: String,
    message: Option<String>,
}

/// Runs a single process until it ends, is killed, or the daemon stops
pub struct ProcessRunner {
    pid: ProcessId,
    tag: DeliveryTag,
    registry: RegistryManager,
    broker: BrokerHandle,
    workload: Arc<dyn Workload>,
    step_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    paused: bool,
    step: u64,
    pending_pauses: Vec<PendingCall>,
    pending_kills: Vec<PendingCall>,
}

impl ProcessRunner {
    pub fn new(
        pid: ProcessId,
        tag: DeliveryTag,
        registry: RegistryManager,
        broker: BrokerHandle,
        workload: Arc<dyn Workload>,
        step_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pid,
            tag,
            registry,
            broker,
            workload,
            step_interval,
            shutdown_rx,
            paused: false,
            step: 0,
            pending_pauses: Vec::new(),
            pending_kills: Vec::new(),
        }
    }

    /// Run the process to completion
    pub async fn run(mut self) -> Result<RunnerExit, WorkerError> {
        debug!(pid = %self.pid, tag = %self.tag, "ProcessRunner::run: called");

        let Some(process) = self.registry.get_process(self.pid).await? else {
            warn!(pid = %self.pid, tag = %self.tag, "Launch task for unknown process, acknowledging");
            self.broker.ack(self.tag).await?;
            return Ok(RunnerExit::Skipped);
        };
        if process.is_terminal() {
            info!(pid = %self.pid, state = %process.state, "Process already terminated, acknowledging task");
            self.broker.ack(self.tag).await?;
            return Ok(RunnerExit::Skipped);
        }

        let mut calls = match self.broker.subscribe(self.pid).await {
            Ok(calls) => calls,
            Err(BrokerError::AlreadySubscribed(_)) => {
                warn!(pid = %self.pid, tag = %self.tag, "Process already running, acknowledging duplicate task");
                self.broker.ack(self.tag).await?;
                return Ok(RunnerExit::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        self.paused = process.paused;
        self.registry.set_state(self.pid, ProcessState::Running).await?;
        info!(pid = %self.pid, paused = self.paused, "Process running");

        let result = self.drive(&mut calls).await;

        // Outstanding deferred calls are failed by the broker on unsubscribe
        if let Err(e) = self.broker.unsubscribe(self.pid).await {
            warn!(pid = %self.pid, error = %e, "Failed to unsubscribe process");
        }
        result
    }

    async fn drive(&mut self, calls: &mut mpsc::Receiver<WorkerMessage>) -> Result<RunnerExit, WorkerError> {
        let mut interval = tokio::time::interval(self.step_interval);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(pid = %self.pid, "Runner stopping for daemon shutdown");
                        return Ok(RunnerExit::Shutdown);
                    }
                }
                msg = calls.recv() => {
                    let Some(WorkerMessage::Call { call_id, action }) = msg else {
                        return Err(BrokerError::ChannelClosed.into());
                    };
                    if let Some(exit) = self.handle_call(call_id, action).await? {
                        return Ok(exit);
                    }
                }
                _ = interval.tick() => {
                    if let Some(exit) = self.step_boundary().await? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn handle_call(&mut self, call_id: String, action: ProcessAction) -> Result<Option<RunnerExit>, WorkerError> {
        debug!(pid = %self.pid, %call_id, %action, "handle_call: called");
        match action {
            ProcessAction::Play => {
                if self.paused {
                    self.registry
                        .modify_process(self.pid, |p| {
                            p.set_paused(false);
                            p.set_status_message(None);
                        })
                        .await?;
                    self.paused = false;
                }
                // A play before the step boundary cancels pending pauses
                for pause in std::mem::take(&mut self.pending_pauses) {
                    self.broker.resolve(&pause.call_id, Ok(false)).await?;
                }
                self.broker.respond(&call_id, CallResponse::Done(true)).await?;
                Ok(None)
            }
            ProcessAction::Pause { message } => {
                if self.paused {
                    self.broker.respond(&call_id, CallResponse::Done(true)).await?;
                } else {
                    self.broker.respond(&call_id, CallResponse::Accepted).await?;
                    self.pending_pauses.push(PendingCall { call_id, message });
                }
                Ok(None)
            }
            ProcessAction::Kill { message, force } => {
                if self.paused || force {
                    self.apply_kill(message).await?;
                    self.broker.respond(&call_id, CallResponse::Done(true)).await?;
                    Ok(Some(RunnerExit::Killed))
                } else {
                    self.broker.respond(&call_id, CallResponse::Accepted).await?;
                    self.pending_kills.push(PendingCall { call_id, message });
                    Ok(None)
                }
            }
            ProcessAction::Continue => {
                self.broker.respond(&call_id, CallResponse::Done(true)).await?;
                Ok(None)
            }
        }
    }

    async fn step_boundary(&mut self) -> Result<Option<RunnerExit>, WorkerError> {
        if let Some(first) = self.pending_kills.first() {
            let message = first.message.clone();
            self.apply_kill(message).await?;
            return Ok(Some(RunnerExit::Killed));
        }
        if self.paused {
            return Ok(None);
        }
        if !self.pending_pauses.is_empty() {
            let message = self.pending_pauses.iter().rev().find_map(|p| p.message.clone());
            self.registry
                .modify_process(self.pid, |p| {
                    p.set_paused(true);
                    p.set_status_message(message);
                })
                .await?;
            self.paused = true;
            info!(pid = %self.pid, "Process paused");
            for pause in std::mem::take(&mut self.pending_pauses) {
                self.broker.resolve(&pause.call_id, Ok(true)).await?;
            }
            return Ok(None);
        }

        let process = self.registry.get_process_required(self.pid).await?;
        match self.workload.step(&process, self.step).await {
            Ok(StepOutcome::Continue) => {
                self.step += 1;
                Ok(None)
            }
            Ok(StepOutcome::Finished) => {
                self.registry.set_state(self.pid, ProcessState::Finished).await?;
                self.broker.ack(self.tag).await?;
                info!(pid = %self.pid, steps = self.step + 1, "Process finished");
                Ok(Some(RunnerExit::Finished))
            }
            Err(reason) => {
                warn!(pid = %self.pid, %reason, "Process excepted");
                self.registry
                    .modify_process(self.pid, |p| {
                        p.set_state(ProcessState::Excepted);
                        p.set_status_message(Some(reason));
                    })
                    .await?;
                self.broker.ack(self.tag).await?;
                Ok(Some(RunnerExit::Excepted))
            }
        }
    }

    /// Mark the process killed, settle pending calls and consume the task
    async fn apply_kill(&mut self, message: Option<String>) -> Result<(), WorkerError> {
        self.registry
            .modify_process(self.pid, |p| {
                p.set_state(ProcessState::Killed);
                p.set_paused(false);
                p.set_status_message(message);
            })
            .await?;
        self.broker.ack(self.tag).await?;
        info!(pid = %self.pid, "Process killed");

        for kill in std::mem::take(&mut self.pending_kills) {
            self.broker.resolve(&kill.call_id, Ok(true)).await?;
        }
        for pause in std::mem::take(&mut self.pending_pauses) {
            self.broker.resolve(&pause.call_id, Ok(false)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig, ControlChannel, RpcReply};
    use crate::domain::TaskPayload;
    use crate::worker::workload::TickWorkload;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        registry: RegistryManager,
        broker: BrokerHandle,
        stop_tx: watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let registry = RegistryManager::spawn(temp.path()).unwrap();
        let broker = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();
        let (stop_tx, _) = watch::channel(false);
        Harness {
            _temp: temp,
            registry,
            broker,
            stop_tx,
        }
    }

    impl Harness {
        async fn launch(&self, steps: u64) -> tokio::task::JoinHandle<Result<RunnerExit, WorkerError>> {
            let process = self.registry.create_process(None).await.unwrap();
            let body = TaskPayload::continue_process(process.id).encode().unwrap();
            let tag = self.broker.publish_body(body).await.unwrap();
            let runner = ProcessRunner::new(
                process.id,
                tag,
                self.registry.clone(),
                self.broker.clone(),
                Arc::new(TickWorkload::new(steps)),
                Duration::from_millis(10),
                self.stop_tx.subscribe(),
            );
            let handle = tokio::spawn(runner.run());
            // Wait for the runner to subscribe
            for _ in 0..100 {
                if self.registry.get_process_required(process.id).await.unwrap().state == ProcessState::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle
        }
    }

    #[tokio::test]
    async fn test_runner_finishes_and_acks() {
        let h = harness().await;
        let handle = h.launch(3).await;

        assert_eq!(handle.await.unwrap().unwrap(), RunnerExit::Finished);
        let process = h.registry.get_process_required(ProcessId(1)).await.unwrap();
        assert_eq!(process.state, ProcessState::Finished);
        assert!(h.broker.queued_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_is_deferred_until_step_boundary() {
        let h = harness().await;
        let _handle = h.launch(0).await;
        let timeout = Duration::from_secs(1);

        let reply = h.broker.call(ProcessId(1), &ProcessAction::pause(None), timeout).await.unwrap();
        let RpcReply::Deferred(deferred) = reply else {
            panic!("pause of a stepping process should be deferred");
        };
        assert_eq!(deferred.await.unwrap(), Ok(true));
        assert!(h.registry.get_process_required(ProcessId(1)).await.unwrap().paused);

        // Pausing again is immediate
        let reply = h.broker.call(ProcessId(1), &ProcessAction::pause(None), timeout).await.unwrap();
        assert!(matches!(reply, RpcReply::Done(true)));

        let reply = h.broker.call(ProcessId(1), &ProcessAction::Play, timeout).await.unwrap();
        assert!(matches!(reply, RpcReply::Done(true)));
        assert!(!h.registry.get_process_required(ProcessId(1)).await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_kill_of_paused_process_is_immediate() {
        let h = harness().await;
        let handle = h.launch(0).await;
        let timeout = Duration::from_secs(1);

        let RpcReply::Deferred(paused) = h.broker.call(ProcessId(1), &ProcessAction::pause(None), timeout).await.unwrap()
        else {
            panic!("expected deferred pause");
        };
        paused.await.unwrap().unwrap();

        let kill = ProcessAction::kill(Some("no longer needed".to_string()), false);
        let reply = h.broker.call(ProcessId(1), &kill, timeout).await.unwrap();
        assert!(matches!(reply, RpcReply::Done(true)));
        assert_eq!(handle.await.unwrap().unwrap(), RunnerExit::Killed);

        let process = h.registry.get_process_required(ProcessId(1)).await.unwrap();
        assert_eq!(process.state, ProcessState::Killed);
        assert_eq!(process.status_message.as_deref(), Some("no longer needed"));
        assert!(h.broker.queued_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_of_running_process_resolves_later() {
        let h = harness().await;
        let handle = h.launch(0).await;

        let reply = h
            .broker
            .call(ProcessId(1), &ProcessAction::kill(None, false), Duration::from_secs(1))
            .await
            .unwrap();
        let RpcReply::Deferred(deferred) = reply else {
            panic!("kill of a stepping process should be deferred");
        };
        assert_eq!(deferred.await.unwrap(), Ok(true));
        assert_eq!(handle.await.unwrap().unwrap(), RunnerExit::Killed);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_task_queued() {
        let h = harness().await;
        let handle = h.launch(0).await;

        h.stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), RunnerExit::Shutdown);
        assert_eq!(h.broker.queued_tasks().await.unwrap().len(), 1);

        // No longer routable once the runner has gone
        let result = h
            .broker
            .call(ProcessId(1), &ProcessAction::Play, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(BrokerError::Unroutable(ProcessId(1)))));
    }

    #[tokio::test]
    async fn test_task_for_terminal_process_is_acknowledged() {
        let h = harness().await;
        let process = h.registry.create_process(None).await.unwrap();
        h.registry.set_state(process.id, ProcessState::Finished).await.unwrap();
        let tag = h
            .broker
            .publish_body(TaskPayload::continue_process(process.id).encode().unwrap())
            .await
            .unwrap();

        let runner = ProcessRunner::new(
            process.id,
            tag,
            h.registry.clone(),
            h.broker.clone(),
            Arc::new(TickWorkload::new(1)),
            Duration::from_millis(10),
            h.stop_tx.subscribe(),
        );
        assert_eq!(runner.run().await.unwrap(), RunnerExit::Skipped);
        assert!(h.broker.queued_tasks().await.unwrap().is_empty());
    }
}
