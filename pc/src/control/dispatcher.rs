//! Single-target action dispatch

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::broker::{BrokerError, ControlChannel, RpcReply};
use crate::domain::{ProcessAction, ProcessId};
use crate::registry::ProcessRegistry;

use super::outcome::{ActionOutcome, ControlError, PendingAction};

/// Sends one action to one process over the RPC channel
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn ProcessRegistry>,
    channel: Arc<dyn ControlChannel>,
    rpc_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn ProcessRegistry>, channel: Arc<dyn ControlChannel>, rpc_timeout: Duration) -> Self {
        debug!(?rpc_timeout, "Dispatcher::new: called");
        Self {
            registry,
            channel,
            rpc_timeout,
        }
    }

    /// Dispatch `action` to `pid`
    ///
    /// Missing and terminal targets are answered from the registry without
    /// touching the channel. Routing failures are not retried.
    pub async fn dispatch(&self, pid: ProcessId, action: &ProcessAction) -> Result<ActionOutcome, ControlError> {
        debug!(%pid, %action, "Dispatcher::dispatch: called");

        let Some(process) = self.registry.get(pid).await? else {
            return Ok(ActionOutcome::Missing);
        };
        if process.is_terminal() {
            debug!(%pid, state = %process.state, "Dispatcher::dispatch: target already terminal");
            return Ok(ActionOutcome::AlreadyTerminated(process.state));
        }

        match self.channel.call(pid, action, self.rpc_timeout).await {
            Ok(RpcReply::Done(result)) => Ok(ActionOutcome::Completed(result)),
            Ok(RpcReply::Deferred(reply)) => Ok(ActionOutcome::Scheduled(PendingAction::new(
                pid,
                action.clone(),
                reply,
            ))),
            Err(BrokerError::Unroutable(_)) => Ok(ActionOutcome::Unreachable),
            Err(BrokerError::Timeout(_)) => Ok(ActionOutcome::TimedOut),
            Err(e) => Err(e.into()),
        }
    }
}
