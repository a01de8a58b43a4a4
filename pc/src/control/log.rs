//! Per-target outcome reporting

use std::fmt;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::domain::{ProcessAction, ProcessId, ProcessState};

/// How an event should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Pending,
    Failure,
    Skipped,
}

/// One reportable thing that happened to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEvent {
    /// Accepted by the worker; the caller is not waiting for the effect
    Sent { pid: ProcessId, action: ProcessAction },
    /// Accepted by the worker; the caller waits for the effect
    Scheduled { pid: ProcessId, action: ProcessAction },
    Completed { pid: ProcessId, action: ProcessAction },
    Refused { pid: ProcessId, action: ProcessAction },
    Failed {
        pid: ProcessId,
        action: ProcessAction,
        reason: String,
    },
    Unreachable { pid: ProcessId },
    TimedOut { pid: ProcessId, action: ProcessAction },
    AlreadyTerminated { pid: ProcessId, state: ProcessState },
    Missing { pid: ProcessId },
}

impl ActionEvent {
    pub fn pid(&self) -> ProcessId {
        match self {
            Self::Sent { pid, .. }
            | Self::Scheduled { pid, .. }
            | Self::Completed { pid, .. }
            | Self::Refused { pid, .. }
            | Self::Failed { pid, .. }
            | Self::Unreachable { pid }
            | Self::TimedOut { pid, .. }
            | Self::AlreadyTerminated { pid, .. }
            | Self::Missing { pid } => *pid,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Completed { .. } => EventKind::Success,
            Self::Sent { .. } | Self::Scheduled { .. } => EventKind::Pending,
            Self::AlreadyTerminated { .. } => EventKind::Skipped,
            Self::Refused { .. }
            | Self::Failed { .. }
            | Self::Unreachable { .. }
            | Self::TimedOut { .. }
            | Self::Missing { .. } => EventKind::Failure,
        }
    }
}

impl fmt::Display for ActionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent { pid, action } => write!(f, "request to {} Process<{pid}> sent", action.infinitive()),
            Self::Scheduled { pid, action } => write!(f, "scheduled {} Process<{pid}>", action.infinitive()),
            Self::Completed { pid, action } => write!(f, "Process<{pid}> {}", action.past()),
            Self::Refused { pid, action } => write!(f, "problem {} Process<{pid}>", action.present()),
            Self::Failed { pid, action, reason } => {
                write!(f, "failed to {} Process<{pid}>: {reason}", action.infinitive())
            }
            Self::Unreachable { pid } => write!(f, "Process<{pid}> is unreachable"),
            Self::TimedOut { pid, action } => write!(f, "timed out {} Process<{pid}>", action.present()),
            Self::AlreadyTerminated { pid, state } => write!(f, "Process<{pid}> is already {state}"),
            Self::Missing { pid } => write!(f, "Process<{pid}> does not exist"),
        }
    }
}

/// Sink for per-target events
pub trait ActionLog: Send + Sync {
    fn record(&self, event: &ActionEvent);
}

/// Writes events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl ActionLog for TracingLog {
    fn record(&self, event: &ActionEvent) {
        match event.kind() {
            EventKind::Failure => warn!(pid = %event.pid(), "{event}"),
            _ => info!(pid = %event.pid(), "{event}"),
        }
    }
}

/// Keeps every event in memory, for callers that render a summary later
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: Mutex<Vec<ActionEvent>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActionEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.events().iter().map(ToString::to_string).collect()
    }
}

impl ActionLog for MemoryLog {
    fn record(&self, event: &ActionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
