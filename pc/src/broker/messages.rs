//! Message types for the Broker

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{DeliveryTag, ProcessAction, ProcessId};

/// Errors from broker operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("No worker owns Process<{0}>")]
    Unroutable(ProcessId),

    #[error("Process<{0}> is already owned by another worker")]
    AlreadySubscribed(ProcessId),

    #[error("RPC call to Process<{0}> timed out")]
    Timeout(ProcessId),

    #[error("Launch queue is held by a consuming worker")]
    QueueBusy,

    #[error("Queue store error: {0}")]
    Store(String),

    #[error("Daemon IPC error: {0}")]
    Ipc(String),

    #[error("Broker channel closed")]
    ChannelClosed,
}

/// Result of a deferred action, resolved by the owning worker
///
/// `Err` carries the worker's description of why the action failed.
pub type DeferredResult = Result<bool, String>;

/// Receiving end of a deferred action
pub type DeferredReply = oneshot::Receiver<DeferredResult>;

/// Reply to an RPC call
#[derive(Debug)]
pub enum RpcReply {
    /// The worker completed the action synchronously
    Done(bool),
    /// The worker accepted the action; the result arrives later
    Deferred(DeferredReply),
}

/// Immediate response a worker gives to a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResponse {
    Done(bool),
    Accepted,
}

/// Messages delivered to the worker owning a process
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    /// Control call; answer with `respond` and, if accepted, `resolve`
    Call { call_id: String, action: ProcessAction },
}

/// A launch-queue entry as stored by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub tag: DeliveryTag,
    pub body: String,
    /// Consumer currently holding the task (None = ready)
    pub consumer: Option<String>,
}

/// Internal requests to the Broker task
#[derive(Debug)]
pub enum BrokerRequest {
    /// Claim RPC ownership of a process id
    Subscribe {
        pid: ProcessId,
        tx: mpsc::Sender<WorkerMessage>,
        reply_tx: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// Release RPC ownership of a process id
    Unsubscribe { pid: ProcessId },

    /// Send a control call to the owner of a process
    Call {
        call_id: String,
        target: ProcessId,
        action: ProcessAction,
        reply_tx: oneshot::Sender<Result<RpcReply, BrokerError>>,
        timeout: Duration,
    },

    /// Immediate response from a worker
    Respond { call_id: String, response: CallResponse },

    /// Final result of an accepted call
    Resolve { call_id: String, result: DeferredResult },

    /// Call timeout notification (internal)
    CallTimeout { call_id: String },

    /// Enqueue a launch task
    Publish {
        body: String,
        reply_tx: oneshot::Sender<Result<DeliveryTag, BrokerError>>,
    },

    /// Snapshot every unacknowledged launch task
    ListTasks {
        reply_tx: oneshot::Sender<Result<Vec<QueuedTask>, BrokerError>>,
    },

    /// Acknowledge (remove) a launch task
    Ack {
        tag: DeliveryTag,
        reply_tx: oneshot::Sender<Result<bool, BrokerError>>,
    },

    /// Take the oldest ready task for a consumer
    Claim {
        consumer: String,
        reply_tx: oneshot::Sender<Result<Option<QueuedTask>, BrokerError>>,
    },

    /// Return every task held by a consumer to the ready state
    Release {
        consumer: String,
        reply_tx: oneshot::Sender<Result<usize, BrokerError>>,
    },

    /// Return a single held task to the ready state
    ReleaseTask {
        tag: DeliveryTag,
        reply_tx: oneshot::Sender<Result<bool, BrokerError>>,
    },

    /// Get current metrics
    GetMetrics { reply_tx: oneshot::Sender<BrokerMetrics> },

    /// Shutdown the broker
    Shutdown,
}

/// Broker metrics for observability
#[derive(Debug, Clone, Default)]
pub struct BrokerMetrics {
    pub subscribed_processes: usize,
    pub pending_calls: usize,
    pub deferred_calls: usize,
    pub calls_routed: u64,
    pub calls_unroutable: u64,
    pub call_timeouts: u64,
    pub tasks_published: u64,
    pub tasks_acked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_process() {
        assert_eq!(BrokerError::Unroutable(ProcessId(9)).to_string(), "No worker owns Process<9>");
        assert_eq!(
            BrokerError::Timeout(ProcessId(3)).to_string(),
            "RPC call to Process<3> timed out"
        );
    }
}
