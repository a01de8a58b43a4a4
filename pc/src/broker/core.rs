//! Main Broker task implementation

use std::collections::HashMap;
use std::path::Path;

use eyre::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::ProcessId;

use super::config::BrokerConfig;
use super::handle::BrokerHandle;
use super::messages::{
    BrokerError, BrokerMetrics, BrokerRequest, CallResponse, DeferredResult, RpcReply, WorkerMessage,
};
use super::store::QueueStore;

/// A call delivered to a worker that has not answered yet
struct PendingCall {
    reply_tx: oneshot::Sender<Result<RpcReply, BrokerError>>,
    target: ProcessId,
}

/// A call the worker accepted and will resolve later
struct DeferredCall {
    resolve_tx: oneshot::Sender<DeferredResult>,
    target: ProcessId,
}

/// The Broker routes control calls to the worker owning each process and
/// owns the durable launch queue
pub struct Broker {
    config: BrokerConfig,
    tx: mpsc::Sender<BrokerRequest>,
    rx: mpsc::Receiver<BrokerRequest>,
    store: QueueStore,
}

impl Broker {
    /// Create a Broker over the launch queue stored in `dir`
    pub fn open(config: BrokerConfig, dir: impl AsRef<Path>) -> Result<Self> {
        debug!(dir = %dir.as_ref().display(), "Broker::open: called");
        let store = QueueStore::open(dir)?;
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        Ok(Self { config, tx, rx, store })
    }

    /// Get a sender for creating handles
    pub fn sender(&self) -> mpsc::Sender<BrokerRequest> {
        self.tx.clone()
    }

    /// Create a handle for talking to this broker
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(self.tx.clone(), self.config.worker_channel_buffer)
    }

    /// Return tasks held by a consumer that exited without releasing them
    ///
    /// Only the consuming daemon calls this, before it starts claiming.
    pub fn release_held(&mut self) -> Result<usize> {
        debug!("Broker::release_held: called");
        self.store.release_all()
    }

    /// Spawn the broker task and return a handle to it
    pub fn spawn(self) -> BrokerHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Run the Broker task
    ///
    /// This consumes the Broker and runs until shutdown is requested.
    pub async fn run(mut self) {
        let broker_tx = self.tx.clone();

        let mut subscribers: HashMap<ProcessId, mpsc::Sender<WorkerMessage>> = HashMap::new();
        let mut pending_calls: HashMap<String, PendingCall> = HashMap::new();
        let mut deferred_calls: HashMap<String, DeferredCall> = HashMap::new();

        let mut metrics = BrokerMetrics::default();

        info!("Broker started");

        while let Some(req) = self.rx.recv().await {
            match req {
                BrokerRequest::Subscribe { pid, tx, reply_tx } => {
                    debug!(%pid, "Subscribing worker");
                    let result = match subscribers.get(&pid) {
                        Some(existing) if !existing.is_closed() => Err(BrokerError::AlreadySubscribed(pid)),
                        _ => {
                            subscribers.insert(pid, tx);
                            Ok(())
                        }
                    };
                    metrics.subscribed_processes = subscribers.len();
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::Unsubscribe { pid } => {
                    debug!(%pid, "Unsubscribing worker");
                    subscribers.remove(&pid);
                    metrics.subscribed_processes = subscribers.len();

                    // Nobody is left to answer calls addressed to this process
                    let unanswered: Vec<String> = pending_calls
                        .iter()
                        .filter(|(_, call)| call.target == pid)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for call_id in unanswered {
                        if let Some(call) = pending_calls.remove(&call_id) {
                            let _ = call.reply_tx.send(Err(BrokerError::Unroutable(pid)));
                        }
                    }

                    let unresolved: Vec<String> = deferred_calls
                        .iter()
                        .filter(|(_, call)| call.target == pid)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for call_id in unresolved {
                        if let Some(call) = deferred_calls.remove(&call_id) {
                            warn!(%pid, %call_id, "Worker exited with an unresolved call");
                            let _ = call.resolve_tx.send(Err("process runner exited".to_string()));
                        }
                    }

                    metrics.pending_calls = pending_calls.len();
                    metrics.deferred_calls = deferred_calls.len();
                }

                BrokerRequest::Call {
                    call_id,
                    target,
                    action,
                    reply_tx,
                    timeout,
                } => {
                    debug!(%call_id, %target, %action, "Routing call");

                    let Some(tx) = subscribers.get(&target) else {
                        debug!(%target, "No subscriber for target");
                        metrics.calls_unroutable += 1;
                        let _ = reply_tx.send(Err(BrokerError::Unroutable(target)));
                        continue;
                    };

                    let msg = WorkerMessage::Call {
                        call_id: call_id.clone(),
                        action,
                    };
                    if tx.send(msg).await.is_err() {
                        debug!(%target, "Subscriber channel closed");
                        subscribers.remove(&target);
                        metrics.subscribed_processes = subscribers.len();
                        metrics.calls_unroutable += 1;
                        let _ = reply_tx.send(Err(BrokerError::Unroutable(target)));
                        continue;
                    }

                    metrics.calls_routed += 1;
                    pending_calls.insert(call_id.clone(), PendingCall { reply_tx, target });
                    metrics.pending_calls = pending_calls.len();

                    // Spawn timeout handler
                    let timeout_tx = broker_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = timeout_tx.send(BrokerRequest::CallTimeout { call_id }).await;
                    });
                }

                BrokerRequest::Respond { call_id, response } => {
                    debug!(%call_id, ?response, "Received call response");

                    let Some(call) = pending_calls.remove(&call_id) else {
                        debug!(%call_id, "Response for unknown or expired call");
                        continue;
                    };
                    metrics.pending_calls = pending_calls.len();

                    let reply = match response {
                        CallResponse::Done(result) => RpcReply::Done(result),
                        CallResponse::Accepted => {
                            let (resolve_tx, resolve_rx) = oneshot::channel();
                            deferred_calls.insert(
                                call_id,
                                DeferredCall {
                                    resolve_tx,
                                    target: call.target,
                                },
                            );
                            metrics.deferred_calls = deferred_calls.len();
                            RpcReply::Deferred(resolve_rx)
                        }
                    };
                    let _ = call.reply_tx.send(Ok(reply));
                }

                BrokerRequest::Resolve { call_id, result } => {
                    debug!(%call_id, ?result, "Resolving deferred call");
                    if let Some(call) = deferred_calls.remove(&call_id) {
                        let _ = call.resolve_tx.send(result);
                        metrics.deferred_calls = deferred_calls.len();
                    }
                }

                BrokerRequest::CallTimeout { call_id } => {
                    if let Some(call) = pending_calls.remove(&call_id) {
                        warn!(%call_id, target = %call.target, "Call timed out");
                        let _ = call.reply_tx.send(Err(BrokerError::Timeout(call.target)));
                        metrics.pending_calls = pending_calls.len();
                        metrics.call_timeouts += 1;
                    }
                }

                BrokerRequest::Publish { body, reply_tx } => {
                    let result = self.store.publish(&body).map_err(|e| BrokerError::Store(e.to_string()));
                    if result.is_ok() {
                        metrics.tasks_published += 1;
                    }
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::ListTasks { reply_tx } => {
                    let result = self.store.list().map_err(|e| BrokerError::Store(e.to_string()));
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::Ack { tag, reply_tx } => {
                    let result = self.store.ack(tag).map_err(|e| BrokerError::Store(e.to_string()));
                    if matches!(result, Ok(true)) {
                        metrics.tasks_acked += 1;
                    }
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::Claim { consumer, reply_tx } => {
                    let result = self
                        .store
                        .claim(&consumer)
                        .map_err(|e| BrokerError::Store(e.to_string()));
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::Release { consumer, reply_tx } => {
                    let result = self
                        .store
                        .release(&consumer)
                        .map_err(|e| BrokerError::Store(e.to_string()));
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::ReleaseTask { tag, reply_tx } => {
                    let result = self
                        .store
                        .release_task(tag)
                        .map_err(|e| BrokerError::Store(e.to_string()));
                    let _ = reply_tx.send(result);
                }

                BrokerRequest::GetMetrics { reply_tx } => {
                    let _ = reply_tx.send(metrics.clone());
                }

                BrokerRequest::Shutdown => {
                    info!("Broker shutting down");
                    break;
                }
            }
        }

        info!("Broker stopped");
    }
}
