//! Message broker for process control
//!
//! The Broker provides the two channels the control plane talks through:
//! - **RPC:** a call addressed by process id, answered by the worker that
//!   owns the process with a result, an acceptance, or nothing at all
//! - **Launch queue:** durable at-least-once tasks that tell a worker to
//!   continue a process

mod config;
mod core;
mod handle;
mod lock;
mod messages;
mod store;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{DeliveryTag, ProcessAction, ProcessId, TaskRecord};

pub use config::BrokerConfig;
pub use core::Broker;
pub use handle::BrokerHandle;
pub use lock::{ExclusiveQueueGuard, QueueLock, SharedQueueGuard};
pub use messages::{
    BrokerError, BrokerMetrics, BrokerRequest, CallResponse, DeferredReply, DeferredResult, QueuedTask, RpcReply,
    WorkerMessage,
};
pub use store::QueueStore;

/// RPC path to the worker owning a process
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send one action and wait at most `timeout` for the worker's answer
    ///
    /// `Unroutable` means no worker owns the process; the caller should not
    /// retry.
    async fn call(&self, target: ProcessId, action: &ProcessAction, timeout: Duration)
    -> Result<RpcReply, BrokerError>;
}

/// Access to the launch queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Every not-yet-acknowledged task, ready or held
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, BrokerError>;

    /// Acknowledge a task without executing it; unknown tags are a no-op
    async fn discard(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Enqueue a continue task for a process
    async fn publish(&self, pid: ProcessId) -> Result<DeliveryTag, BrokerError>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::oneshot;
    use tracing::debug;

    /// Scripted answer for one process id
    pub enum MockReply {
        Done(bool),
        /// Deferred; resolved with the given result after the delay
        Later(Duration, DeferredResult),
        /// Deferred and never resolved
        Never,
        Unroutable,
        Timeout,
    }

    /// Mock RPC channel recording every call
    #[derive(Default)]
    pub struct MockChannel {
        replies: Mutex<HashMap<ProcessId, MockReply>>,
        calls: Mutex<Vec<(ProcessId, String)>>,
        // Keeps never-resolving handles alive
        parked: Mutex<Vec<oneshot::Sender<DeferredResult>>>,
    }

    impl MockChannel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, pid: u64, reply: MockReply) -> Self {
            if let Ok(mut replies) = self.replies.lock() {
                replies.insert(ProcessId(pid), reply);
            }
            self
        }

        pub fn calls(&self) -> Vec<(ProcessId, String)> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ControlChannel for MockChannel {
        async fn call(
            &self,
            target: ProcessId,
            action: &ProcessAction,
            _timeout: Duration,
        ) -> Result<RpcReply, BrokerError> {
            debug!(%target, %action, "MockChannel::call: called");
            self.calls.lock().unwrap().push((target, action.infinitive().to_string()));

            let replies = self.replies.lock().unwrap();
            match replies.get(&target) {
                None | Some(MockReply::Done(true)) => Ok(RpcReply::Done(true)),
                Some(MockReply::Done(false)) => Ok(RpcReply::Done(false)),
                Some(MockReply::Later(delay, result)) => {
                    let (tx, rx) = oneshot::channel();
                    let delay = *delay;
                    let result = result.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(result);
                    });
                    Ok(RpcReply::Deferred(rx))
                }
                Some(MockReply::Never) => {
                    let (tx, rx) = oneshot::channel();
                    self.parked.lock().unwrap().push(tx);
                    Ok(RpcReply::Deferred(rx))
                }
                Some(MockReply::Unroutable) => Err(BrokerError::Unroutable(target)),
                Some(MockReply::Timeout) => Err(BrokerError::Timeout(target)),
            }
        }
    }

    /// In-memory launch queue
    #[derive(Default)]
    pub struct MockQueue {
        tasks: Mutex<BTreeMap<DeliveryTag, ProcessId>>,
        next_tag: AtomicI64,
        fail_list: bool,
    }

    impl MockQueue {
        pub fn new() -> Self {
            Self::default()
        }

        /// A queue whose listing always fails
        pub fn failing() -> Self {
            Self {
                fail_list: true,
                ..Self::default()
            }
        }

        pub fn with_tasks(ids: &[u64]) -> Self {
            let queue = Self::new();
            for id in ids {
                queue.push(ProcessId(*id));
            }
            queue
        }

        pub fn push(&self, pid: ProcessId) -> DeliveryTag {
            let tag = DeliveryTag(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1);
            self.tasks.lock().unwrap().insert(tag, pid);
            tag
        }

        pub fn snapshot(&self) -> Vec<(DeliveryTag, ProcessId)> {
            self.tasks.lock().unwrap().iter().map(|(t, p)| (*t, *p)).collect()
        }
    }

    #[async_trait]
    impl TaskQueue for MockQueue {
        async fn list_tasks(&self) -> Result<Vec<TaskRecord>, BrokerError> {
            debug!("MockQueue::list_tasks: called");
            if self.fail_list {
                return Err(BrokerError::Store("queue unavailable".to_string()));
            }
            Ok(self
                .snapshot()
                .into_iter()
                .map(|(delivery_tag, target_id)| TaskRecord {
                    target_id,
                    delivery_tag,
                })
                .collect())
        }

        async fn discard(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
            debug!(%tag, "MockQueue::discard: called");
            self.tasks.lock().unwrap().remove(&tag);
            Ok(())
        }

        async fn publish(&self, pid: ProcessId) -> Result<DeliveryTag, BrokerError> {
            debug!(%pid, "MockQueue::publish: called");
            Ok(self.push(pid))
        }
    }
}
