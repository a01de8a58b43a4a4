//! BrokerHandle - client interface for workers and the control plane

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{DeliveryTag, ProcessAction, ProcessId, TaskPayload, TaskRecord};

use super::messages::{
    BrokerError, BrokerMetrics, BrokerRequest, CallResponse, DeferredResult, QueuedTask, RpcReply, WorkerMessage,
};
use super::{ControlChannel, TaskQueue};

/// Handle for talking to the Broker task
///
/// Cloneable; every clone talks to the same broker.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerRequest>,
    worker_buffer: usize,
}

impl BrokerHandle {
    pub(crate) fn new(tx: mpsc::Sender<BrokerRequest>, worker_buffer: usize) -> Self {
        debug!(%worker_buffer, "BrokerHandle::new: called");
        Self { tx, worker_buffer }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, BrokerError>>) -> BrokerRequest,
    ) -> Result<T, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| BrokerError::ChannelClosed)?
    }

    /// Claim RPC ownership of a process and receive its calls
    pub async fn subscribe(&self, pid: ProcessId) -> Result<mpsc::Receiver<WorkerMessage>, BrokerError> {
        debug!(%pid, "BrokerHandle::subscribe: called");
        let (tx, rx) = mpsc::channel(self.worker_buffer);
        self.request(|reply_tx| BrokerRequest::Subscribe { pid, tx, reply_tx })
            .await?;
        Ok(rx)
    }

    /// Release RPC ownership of a process
    pub async fn unsubscribe(&self, pid: ProcessId) -> Result<(), BrokerError> {
        debug!(%pid, "BrokerHandle::unsubscribe: called");
        self.tx
            .send(BrokerRequest::Unsubscribe { pid })
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Answer a call delivered to this worker
    pub async fn respond(&self, call_id: &str, response: CallResponse) -> Result<(), BrokerError> {
        debug!(%call_id, ?response, "BrokerHandle::respond: called");
        self.tx
            .send(BrokerRequest::Respond {
                call_id: call_id.to_string(),
                response,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Deliver the final result of an accepted call
    pub async fn resolve(&self, call_id: &str, result: DeferredResult) -> Result<(), BrokerError> {
        debug!(%call_id, ?result, "BrokerHandle::resolve: called");
        self.tx
            .send(BrokerRequest::Resolve {
                call_id: call_id.to_string(),
                result,
            })
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }

    /// Enqueue a raw task body
    pub async fn publish_body(&self, body: String) -> Result<DeliveryTag, BrokerError> {
        debug!(%body, "BrokerHandle::publish_body: called");
        self.request(|reply_tx| BrokerRequest::Publish { body, reply_tx })
            .await
    }

    /// Every unacknowledged task, including the raw body and holder
    pub async fn queued_tasks(&self) -> Result<Vec<QueuedTask>, BrokerError> {
        debug!("BrokerHandle::queued_tasks: called");
        self.request(|reply_tx| BrokerRequest::ListTasks { reply_tx }).await
    }

    /// Acknowledge a task; false when it was already gone
    pub async fn ack(&self, tag: DeliveryTag) -> Result<bool, BrokerError> {
        debug!(%tag, "BrokerHandle::ack: called");
        self.request(|reply_tx| BrokerRequest::Ack { tag, reply_tx }).await
    }

    /// Take the oldest ready task for a consumer
    pub async fn claim(&self, consumer: &str) -> Result<Option<QueuedTask>, BrokerError> {
        debug!(%consumer, "BrokerHandle::claim: called");
        let consumer = consumer.to_string();
        self.request(|reply_tx| BrokerRequest::Claim { consumer, reply_tx })
            .await
    }

    /// Return a consumer's held tasks to the ready state
    pub async fn release(&self, consumer: &str) -> Result<usize, BrokerError> {
        debug!(%consumer, "BrokerHandle::release: called");
        let consumer = consumer.to_string();
        self.request(|reply_tx| BrokerRequest::Release { consumer, reply_tx })
            .await
    }

    /// Return one held task to the ready state; false when it was not held
    pub async fn release_task(&self, tag: DeliveryTag) -> Result<bool, BrokerError> {
        debug!(%tag, "BrokerHandle::release_task: called");
        self.request(|reply_tx| BrokerRequest::ReleaseTask { tag, reply_tx })
            .await
    }

    /// Get current broker metrics
    pub async fn metrics(&self) -> Result<BrokerMetrics, BrokerError> {
        debug!("BrokerHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BrokerRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| BrokerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| BrokerError::ChannelClosed)
    }

    /// Request shutdown of the Broker
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        debug!("BrokerHandle::shutdown: called");
        self.tx
            .send(BrokerRequest::Shutdown)
            .await
            .map_err(|_| BrokerError::ChannelClosed)
    }
}

#[async_trait]
impl ControlChannel for BrokerHandle {
    async fn call(
        &self,
        target: ProcessId,
        action: &ProcessAction,
        timeout: Duration,
    ) -> Result<RpcReply, BrokerError> {
        debug!(%target, %action, ?timeout, "BrokerHandle::call: called");
        let call_id = Uuid::now_v7().to_string();
        let action = action.clone();

        // The broker enforces the timeout
        self.request(|reply_tx| BrokerRequest::Call {
            call_id,
            target,
            action,
            reply_tx,
            timeout,
        })
        .await
    }
}

#[async_trait]
impl TaskQueue for BrokerHandle {
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, BrokerError> {
        debug!("BrokerHandle::list_tasks: called");
        let queued = self.queued_tasks().await?;

        let mut records = Vec::with_capacity(queued.len());
        for task in queued {
            match TaskPayload::decode(&task.body) {
                Ok(payload) => records.push(TaskRecord {
                    target_id: payload.pid,
                    delivery_tag: task.tag,
                }),
                Err(e) => {
                    warn!(tag = %task.tag, body = %task.body, error = %e, "Skipping task with malformed body");
                }
            }
        }
        Ok(records)
    }

    async fn discard(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        debug!(%tag, "BrokerHandle::discard: called");
        if !self.ack(tag).await? {
            debug!(%tag, "BrokerHandle::discard: task already gone");
        }
        Ok(())
    }

    async fn publish(&self, pid: ProcessId) -> Result<DeliveryTag, BrokerError> {
        debug!(%pid, "BrokerHandle::publish: called");
        let body = TaskPayload::continue_process(pid)
            .encode()
            .map_err(|e| BrokerError::Store(e.to_string()))?;
        self.publish_body(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_publish_list_discard() {
        let temp = tempdir().unwrap();
        let handle = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();

        let tag = handle.publish(ProcessId(7)).await.unwrap();
        let tasks = handle.list_tasks().await.unwrap();
        assert_eq!(
            tasks,
            vec![TaskRecord {
                target_id: ProcessId(7),
                delivery_tag: tag
            }]
        );

        handle.discard(tag).await.unwrap();
        // Discarding twice is a no-op
        handle.discard(tag).await.unwrap();
        assert!(handle.list_tasks().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_skipped() {
        let temp = tempdir().unwrap();
        let handle = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();

        handle.publish_body("not json".to_string()).await.unwrap();
        handle.publish(ProcessId(1)).await.unwrap();

        let tasks = handle.list_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target_id, ProcessId(1));
        assert_eq!(handle.queued_tasks().await.unwrap().len(), 2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_through_handle() {
        let temp = tempdir().unwrap();
        let handle = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();

        let mut calls = handle.subscribe(ProcessId(3)).await.unwrap();
        let worker = handle.clone();
        tokio::spawn(async move {
            if let Some(WorkerMessage::Call { call_id, .. }) = calls.recv().await {
                worker.respond(&call_id, CallResponse::Done(false)).await.unwrap();
            }
        });

        let reply = handle
            .call(ProcessId(3), &ProcessAction::Play, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(reply, RpcReply::Done(false)));

        let unroutable = handle
            .call(ProcessId(4), &ProcessAction::Play, Duration::from_secs(5))
            .await;
        assert!(matches!(unroutable, Err(BrokerError::Unroutable(ProcessId(4)))));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let temp = tempdir().unwrap();
        let handle = Broker::open(BrokerConfig::default(), temp.path()).unwrap().spawn();

        let tag = handle.publish(ProcessId(2)).await.unwrap();
        let claimed = handle.claim("worker").await.unwrap().unwrap();
        assert_eq!(claimed.tag, tag);
        assert!(handle.claim("worker").await.unwrap().is_none());

        assert_eq!(handle.release("worker").await.unwrap(), 1);
        assert!(handle.claim("other").await.unwrap().is_some());

        handle.shutdown().await.unwrap();
    }
}
