//! Batch dispatch with optional waiting on deferred outcomes

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{debug, info, warn};

use crate::domain::{ProcessAction, ProcessId};

use super::dispatcher::Dispatcher;
use super::log::{ActionEvent, ActionLog, TracingLog};
use super::outcome::{ActionOutcome, BatchReport, ControlError};

/// Fans one action out over many targets and aggregates the outcomes
#[derive(Clone)]
pub struct BatchResolver {
    dispatcher: Dispatcher,
    log: Arc<dyn ActionLog>,
}

impl BatchResolver {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            log: Arc::new(TracingLog),
        }
    }

    /// Report per-target events somewhere other than tracing
    pub fn with_log(mut self, log: Arc<dyn ActionLog>) -> Self {
        self.log = log;
        self
    }

    /// Dispatch `action` to every target, in order
    ///
    /// With `wait`, blocks until every scheduled action resolves. `timeout`
    /// bounds each wave of waiting and restarts whenever one action resolves.
    /// Elapsing with actions outstanding is the only error a partially
    /// failed batch produces.
    pub async fn dispatch_batch(
        &self,
        targets: &[ProcessId],
        action: &ProcessAction,
        wait: bool,
        timeout: Duration,
    ) -> Result<BatchReport, ControlError> {
        debug!(count = targets.len(), %action, wait, ?timeout, "BatchResolver::dispatch_batch: called");
        let mut report = BatchReport::new(action.clone());
        let mut waiting = FuturesUnordered::new();
        let mut outstanding: Vec<ProcessId> = Vec::new();

        for &pid in targets {
            let outcome = match self.dispatcher.dispatch(pid, action).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let reason = e.to_string();
                    self.emit(ActionEvent::Failed {
                        pid,
                        action: action.clone(),
                        reason: reason.clone(),
                    });
                    report.fail(pid, reason);
                    continue;
                }
            };

            match outcome {
                ActionOutcome::Completed(true) => {
                    self.emit(ActionEvent::Completed {
                        pid,
                        action: action.clone(),
                    });
                    report.succeeded.push(pid);
                }
                ActionOutcome::Completed(false) => {
                    self.emit(ActionEvent::Refused {
                        pid,
                        action: action.clone(),
                    });
                    report.fail(pid, "refused by the process");
                }
                ActionOutcome::Scheduled(pending) if wait => {
                    self.emit(ActionEvent::Scheduled {
                        pid,
                        action: action.clone(),
                    });
                    outstanding.push(pid);
                    waiting.push(pending.resolve());
                }
                ActionOutcome::Scheduled(_) => {
                    self.emit(ActionEvent::Sent {
                        pid,
                        action: action.clone(),
                    });
                    report.scheduled.push(pid);
                }
                ActionOutcome::Unreachable => {
                    self.emit(ActionEvent::Unreachable { pid });
                    report.fail(pid, "unreachable");
                }
                ActionOutcome::TimedOut => {
                    self.emit(ActionEvent::TimedOut {
                        pid,
                        action: action.clone(),
                    });
                    report.fail(pid, "no response from the worker");
                }
                ActionOutcome::AlreadyTerminated(state) => {
                    self.emit(ActionEvent::AlreadyTerminated { pid, state });
                    report.skipped.push((pid, state));
                }
                ActionOutcome::Missing => {
                    self.emit(ActionEvent::Missing { pid });
                    report.fail(pid, "does not exist");
                }
            }
        }

        while !waiting.is_empty() {
            match tokio::time::timeout(timeout, waiting.next()).await {
                Ok(Some((pid, result))) => {
                    if let Some(pos) = outstanding.iter().position(|p| *p == pid) {
                        outstanding.remove(pos);
                    }
                    match result {
                        Ok(true) => {
                            self.emit(ActionEvent::Completed {
                                pid,
                                action: action.clone(),
                            });
                            report.succeeded.push(pid);
                        }
                        Ok(false) => {
                            self.emit(ActionEvent::Refused {
                                pid,
                                action: action.clone(),
                            });
                            report.fail(pid, "refused by the process");
                        }
                        Err(reason) => {
                            self.emit(ActionEvent::Failed {
                                pid,
                                action: action.clone(),
                                reason: reason.clone(),
                            });
                            report.fail(pid, reason);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    outstanding.sort();
                    warn!(action = %action, pending = ?outstanding, "Timed out waiting for scheduled actions");
                    return Err(ControlError::Timeout {
                        action: action.infinitive().to_string(),
                        pending: outstanding,
                    });
                }
            }
        }

        info!(%report, "Batch complete");
        Ok(report)
    }

    fn emit(&self, event: ActionEvent) {
        self.log.record(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{MockChannel, MockReply};
    use crate::control::log::MemoryLog;
    use crate::domain::ProcessState;
    use crate::registry::mock::MockRegistry;

    fn resolver(registry: MockRegistry, channel: MockChannel) -> (BatchResolver, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(channel), Duration::from_secs(1));
        (BatchResolver::new(dispatcher).with_log(log.clone()), log)
    }

    fn ids(raw: &[u64]) -> Vec<ProcessId> {
        raw.iter().copied().map(ProcessId).collect()
    }

    #[tokio::test]
    async fn test_partial_failure_is_not_an_error() {
        let channel = MockChannel::new().reply(2, MockReply::Unroutable);
        let (resolver, log) = resolver(MockRegistry::running(&[1, 2, 3]), channel);

        let report = resolver
            .dispatch_batch(&ids(&[1, 2, 3]), &ProcessAction::kill(None, false), false, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.succeeded, ids(&[1, 3]));
        assert_eq!(report.failed_ids(), ids(&[2]));
        assert_eq!(
            log.lines(),
            vec!["Process<1> killed", "Process<2> is unreachable", "Process<3> killed"]
        );
    }

    #[tokio::test]
    async fn test_wait_resolves_scheduled_actions() {
        let channel = MockChannel::new()
            .reply(1, MockReply::Later(Duration::from_millis(20), Ok(true)))
            .reply(2, MockReply::Later(Duration::from_millis(10), Err("boom".to_string())));
        let (resolver, log) = resolver(MockRegistry::running(&[1, 2]), channel);

        let report = resolver
            .dispatch_batch(&ids(&[1, 2]), &ProcessAction::pause(None), true, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.succeeded, ids(&[1]));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].reason, "boom");
        assert!(report.scheduled.is_empty());

        // Scheduled line first, then the resolution of each
        let lines = log.lines();
        assert_eq!(lines[0], "scheduled pause Process<1>");
        assert_eq!(lines[1], "scheduled pause Process<2>");
        assert!(lines.contains(&"Process<1> paused".to_string()));
        assert!(lines.contains(&"failed to pause Process<2>: boom".to_string()));
    }

    #[tokio::test]
    async fn test_no_wait_leaves_actions_scheduled() {
        let channel = MockChannel::new().reply(4, MockReply::Never);
        let (resolver, log) = resolver(MockRegistry::running(&[4]), channel);

        let report = resolver
            .dispatch_batch(&ids(&[4]), &ProcessAction::Play, false, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(report.scheduled, ids(&[4]));
        assert_eq!(log.lines(), vec!["request to play Process<4> sent"]);
    }

    #[tokio::test]
    async fn test_timeout_escalates_naming_pending() {
        let channel = MockChannel::new()
            .reply(5, MockReply::Never)
            .reply(6, MockReply::Later(Duration::from_millis(5), Ok(true)));
        let (resolver, _log) = resolver(MockRegistry::running(&[5, 6]), channel);

        let result = resolver
            .dispatch_batch(&ids(&[5, 6]), &ProcessAction::kill(None, false), true, Duration::from_millis(100))
            .await;

        match result {
            Err(ControlError::Timeout { action, pending }) => {
                assert_eq!(action, "kill");
                assert_eq!(pending, ids(&[5]));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_targets_are_skipped() {
        let registry = MockRegistry::running(&[1]).with(2, ProcessState::Killed, false);
        let (resolver, log) = resolver(registry, MockChannel::new());

        let report = resolver
            .dispatch_batch(&ids(&[1, 2]), &ProcessAction::kill(None, false), false, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.skipped, vec![(ProcessId(2), ProcessState::Killed)]);
        assert_eq!(log.lines()[1], "Process<2> is already killed");
    }
}
