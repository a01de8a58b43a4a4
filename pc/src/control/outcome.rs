//! Outcomes of dispatching control actions

use std::fmt;

use thiserror::Error;

use crate::broker::{BrokerError, DeferredReply, DeferredResult};
use crate::domain::{ProcessAction, ProcessId, ProcessState};
use crate::registry::RegistryError;

/// Errors from the control plane
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(
        "timed out trying to {action} {}. The daemon workers may be too busy to respond: \
         check the daemon log and retry, or run `pc process repair` if the daemon is stopped",
        format_pids(.pending)
    )]
    Timeout { action: String, pending: Vec<ProcessId> },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Render ids as `Process<1>, Process<2>`
pub fn format_pids(pids: &[ProcessId]) -> String {
    pids.iter()
        .map(|pid| format!("Process<{pid}>"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Handle to an action the owning worker accepted but has not finished
#[derive(Debug)]
pub struct PendingAction {
    pub pid: ProcessId,
    pub action: ProcessAction,
    reply: DeferredReply,
}

impl PendingAction {
    pub fn new(pid: ProcessId, action: ProcessAction, reply: DeferredReply) -> Self {
        Self { pid, action, reply }
    }

    /// Wait for the worker to finish the action
    pub async fn resolve(self) -> (ProcessId, DeferredResult) {
        let result = self
            .reply
            .await
            .unwrap_or_else(|_| Err("result channel closed before the action finished".to_string()));
        (self.pid, result)
    }
}

/// What happened when an action was sent to one process
#[derive(Debug)]
pub enum ActionOutcome {
    /// The worker answered synchronously
    Completed(bool),
    /// The worker accepted; the effect arrives later
    Scheduled(PendingAction),
    /// No worker owns the process
    Unreachable,
    /// The worker did not answer within the RPC timeout
    TimedOut,
    /// The process was already terminal; nothing was sent
    AlreadyTerminated(ProcessState),
    /// The registry has no such process; nothing was sent
    Missing,
}

/// A target the action could not be applied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub pid: ProcessId,
    pub reason: String,
}

/// Aggregate result of fanning an action out over many targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub action: ProcessAction,
    /// Targets the action was applied to
    pub succeeded: Vec<ProcessId>,
    /// Targets that accepted the action without being waited on
    pub scheduled: Vec<ProcessId>,
    pub failures: Vec<ActionFailure>,
    /// Targets that were already terminal
    pub skipped: Vec<(ProcessId, ProcessState)>,
}

impl BatchReport {
    pub fn new(action: ProcessAction) -> Self {
        Self {
            action,
            succeeded: Vec::new(),
            scheduled: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub(crate) fn fail(&mut self, pid: ProcessId, reason: impl Into<String>) {
        self.failures.push(ActionFailure {
            pid,
            reason: reason.into(),
        });
    }

    /// True when no target failed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<ProcessId> {
        self.failures.iter().map(|f| f.pid).collect()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {}, {} scheduled, {} failed, {} skipped",
            self.action,
            self.succeeded.len(),
            self.action.past(),
            self.scheduled.len(),
            self.failures.len(),
            self.skipped.len()
        )
    }
}
