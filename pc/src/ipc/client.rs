//! IPC client for communicating with the daemon
//!
//! The CLI reaches running processes through this client: control calls are
//! forwarded to the daemon's broker, which routes them to the owning worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::{BrokerError, ControlChannel, RpcReply};
use crate::domain::{ProcessAction, ProcessId};

use super::MAX_MESSAGE_SIZE;
use super::messages::{DaemonMessage, DaemonResponse};

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for communicating with the daemon via IPC
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    /// Create a client for the socket at `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        let response = self.send_message(DaemonMessage::Ping).await?;
        match response {
            DaemonResponse::Pong { version } => Ok(version),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        let response = self.send_message(DaemonMessage::Shutdown).await?;
        match response {
            DaemonResponse::Ok => Ok(()),
            DaemonResponse::Error { message } => Err(eyre::eyre!("Daemon error: {}", message)),
            _ => Err(eyre::eyre!("Unexpected response")),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")
    }

    /// Send a message to the daemon and wait for response
    async fn send_message(&self, msg: DaemonMessage) -> Result<DaemonResponse> {
        debug!(?self.socket_path, ?msg, "DaemonClient: sending message");
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        write_line(&mut write_half, &msg, self.timeout).await?;

        let mut reader = BufReader::new(read_half);
        read_response(&mut reader, self.timeout).await
    }
}

async fn write_line(
    stream: &mut tokio::net::unix::OwnedWriteHalf,
    msg: &DaemonMessage,
    timeout: Duration,
) -> Result<()> {
    let msg_json = serde_json::to_string(msg).context("Failed to serialize message")?;

    if msg_json.len() > MAX_MESSAGE_SIZE {
        return Err(eyre::eyre!("Message too large: {} bytes", msg_json.len()));
    }

    tokio::time::timeout(timeout, async {
        stream
            .write_all(msg_json.as_bytes())
            .await
            .context("Failed to write message")?;
        stream.write_all(b"\n").await.context("Failed to write newline")?;
        stream.flush().await.context("Failed to flush stream")?;
        Ok::<_, eyre::Error>(())
    })
    .await
    .context("Write timeout")?
}

async fn read_response(reader: &mut BufReader<OwnedReadHalf>, timeout: Duration) -> Result<DaemonResponse> {
    let mut response_line = String::new();
    let bytes_read = tokio::time::timeout(timeout, reader.read_line(&mut response_line))
        .await
        .context("Read timeout")?
        .context("Failed to read response")?;

    if bytes_read == 0 {
        return Err(eyre::eyre!("Daemon closed the connection"));
    }
    if bytes_read > MAX_MESSAGE_SIZE {
        return Err(eyre::eyre!("Response too large: {} bytes", bytes_read));
    }

    let response: DaemonResponse =
        serde_json::from_str(response_line.trim()).context("Failed to parse daemon response")?;
    debug!(?response, "DaemonClient: received response");
    Ok(response)
}

#[async_trait]
impl ControlChannel for DaemonClient {
    async fn call(
        &self,
        target: ProcessId,
        action: &ProcessAction,
        timeout: Duration,
    ) -> Result<RpcReply, BrokerError> {
        debug!(%target, %action, ?timeout, "DaemonClient::call: called");

        // No daemon listening means no worker can own the process
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "DaemonClient::call: daemon not reachable");
                return Err(BrokerError::Unroutable(target));
            }
        };
        let (read_half, mut write_half) = stream.into_split();

        let msg = DaemonMessage::Call {
            pid: target,
            action: action.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        write_line(&mut write_half, &msg, self.timeout)
            .await
            .map_err(|e| BrokerError::Ipc(e.to_string()))?;

        // The daemon enforces the RPC timeout; allow for the round trip on top
        let mut reader = BufReader::new(read_half);
        let response = read_response(&mut reader, timeout + self.timeout)
            .await
            .map_err(|e| BrokerError::Ipc(e.to_string()))?;

        match response {
            DaemonResponse::Done { result } => Ok(RpcReply::Done(result)),
            DaemonResponse::Accepted => {
                let (resolve_tx, resolve_rx) = oneshot::channel();
                tokio::spawn(async move {
                    // Keep the write half alive so the daemon does not see EOF
                    let _write_half = write_half;
                    let mut line = String::new();
                    let result = match reader.read_line(&mut line).await {
                        Ok(0) => Err("daemon closed the connection".to_string()),
                        Ok(_) => match serde_json::from_str::<DaemonResponse>(line.trim()) {
                            Ok(DaemonResponse::Resolved { result }) => Ok(result),
                            Ok(DaemonResponse::Failed { message }) => Err(message),
                            Ok(other) => Err(format!("unexpected response: {other:?}")),
                            Err(e) => Err(format!("malformed response: {e}")),
                        },
                        Err(e) => Err(e.to_string()),
                    };
                    if let Err(reason) = &result {
                        warn!(%target, %reason, "Deferred call failed");
                    }
                    let _ = resolve_tx.send(result);
                });
                Ok(RpcReply::Deferred(resolve_rx))
            }
            DaemonResponse::Unroutable => Err(BrokerError::Unroutable(target)),
            DaemonResponse::TimedOut => Err(BrokerError::Timeout(target)),
            DaemonResponse::Error { message } => Err(BrokerError::Ipc(message)),
            other => Err(BrokerError::Ipc(format!("Unexpected response: {other:?}"))),
        }
    }
}
