//! IPC listener for the daemon side
//!
//! Provides helpers for creating the Unix Domain Socket listener and the
//! accept loop that forwards control calls into the daemon's broker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, ControlChannel, RpcReply};

use super::MAX_MESSAGE_SIZE;
use super::messages::{DaemonMessage, DaemonResponse};

/// Create a listener at a specific path
///
/// Handles cleanup of stale socket files from previous runs.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener: creating IPC socket");

    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    // Clean up stale socket if exists
    if socket_path.exists() {
        debug!(?socket_path, "create_listener: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind IPC socket")?;
    debug!(?socket_path, "create_listener: socket bound successfully");

    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Read one message line
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<DaemonMessage> {
    let mut line = String::new();

    let bytes_read = reader
        .read_line(&mut line)
        .await
        .context("Failed to read IPC message")?;

    if bytes_read > MAX_MESSAGE_SIZE {
        return Err(eyre::eyre!("Message too large: {} bytes", bytes_read));
    }

    if line.is_empty() {
        return Err(eyre::eyre!("Empty message received"));
    }

    let msg: DaemonMessage = serde_json::from_str(line.trim()).context("Failed to parse IPC message")?;
    debug!(?msg, "read_message: parsed message");

    Ok(msg)
}

/// Send a response on the stream
pub async fn send_response<W: AsyncWrite + Unpin>(stream: &mut W, response: DaemonResponse) -> Result<()> {
    let response_json = serde_json::to_string(&response).context("Failed to serialize response")?;
    stream
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write response")?;
    stream.write_all(b"\n").await.context("Failed to write newline")?;
    stream.flush().await.context("Failed to flush response")?;
    debug!(?response, "send_response: sent response");
    Ok(())
}

/// Accept connections until the task is aborted
///
/// A `Shutdown` message is acknowledged and forwarded on `shutdown_tx`.
pub async fn serve(
    listener: UnixListener,
    channel: Arc<dyn ControlChannel>,
    shutdown_tx: mpsc::Sender<()>,
    version: String,
) {
    info!("IPC listener accepting connections");
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let channel = channel.clone();
                let shutdown_tx = shutdown_tx.clone();
                let version = version.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, channel, shutdown_tx, version).await {
                        warn!(error = %e, "IPC connection failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept IPC connection");
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    channel: Arc<dyn ControlChannel>,
    shutdown_tx: mpsc::Sender<()>,
    version: String,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let msg = read_message(&mut reader).await?;

    match msg {
        DaemonMessage::Ping => {
            send_response(&mut write_half, DaemonResponse::Pong { version }).await?;
        }

        DaemonMessage::Shutdown => {
            info!("Shutdown requested over IPC");
            send_response(&mut write_half, DaemonResponse::Ok).await?;
            let _ = shutdown_tx.send(()).await;
        }

        DaemonMessage::Call {
            pid,
            action,
            timeout_ms,
        } => {
            debug!(%pid, %action, timeout_ms, "handle_connection: forwarding call");
            let reply = channel.call(pid, &action, Duration::from_millis(timeout_ms)).await;
            match reply {
                Ok(RpcReply::Done(result)) => {
                    send_response(&mut write_half, DaemonResponse::Done { result }).await?;
                }
                Ok(RpcReply::Deferred(deferred)) => {
                    send_response(&mut write_half, DaemonResponse::Accepted).await?;
                    let response = match deferred.await {
                        Ok(Ok(result)) => DaemonResponse::Resolved { result },
                        Ok(Err(message)) => DaemonResponse::Failed { message },
                        Err(_) => DaemonResponse::Failed {
                            message: "daemon shut down before the action finished".to_string(),
                        },
                    };
                    // A caller that did not wait has already hung up
                    if let Err(e) = send_response(&mut write_half, response).await {
                        debug!(%pid, error = %e, "Caller left before the deferred result");
                    }
                }
                Err(BrokerError::Unroutable(_)) => {
                    send_response(&mut write_half, DaemonResponse::Unroutable).await?;
                }
                Err(BrokerError::Timeout(_)) => {
                    send_response(&mut write_half, DaemonResponse::TimedOut).await?;
                }
                Err(e) => {
                    send_response(&mut write_half, DaemonResponse::Error { message: e.to_string() }).await?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{MockChannel, MockReply};
    use crate::domain::{ProcessAction, ProcessId};
    use crate::ipc::DaemonClient;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_listener_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("subdir").join("daemon.sock");

        let (_, path) = create_listener_at(&socket_path).unwrap();
        assert_eq!(path, socket_path);
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_create_listener_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("daemon.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        assert!(create_listener_at(&socket_path).is_ok());
    }

    #[test]
    fn test_cleanup_socket_handles_missing_file() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("nonexistent.sock");

        // Should not panic
        cleanup_socket(&socket_path);
    }

    async fn start_server(channel: MockChannel) -> (TempDir, DaemonClient, mpsc::Receiver<()>) {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("daemon.sock");
        let (listener, _) = create_listener_at(&socket_path).unwrap();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(serve(listener, Arc::new(channel), shutdown_tx, "test-version".to_string()));
        (temp, DaemonClient::new(socket_path), shutdown_rx)
    }

    #[tokio::test]
    async fn test_end_to_end_ping_and_shutdown() {
        let (_temp, client, mut shutdown_rx) = start_server(MockChannel::new()).await;

        assert_eq!(client.ping().await.unwrap(), "test-version");
        client.shutdown().await.unwrap();
        assert!(shutdown_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_end_to_end_calls() {
        let channel = MockChannel::new()
            .reply(1, MockReply::Done(true))
            .reply(2, MockReply::Unroutable)
            .reply(3, MockReply::Later(Duration::from_millis(20), Ok(true)))
            .reply(4, MockReply::Later(Duration::from_millis(5), Err("worker crashed".to_string())));
        let (_temp, client, _shutdown_rx) = start_server(channel).await;
        let timeout = Duration::from_secs(1);
        let pause = ProcessAction::pause(None);

        let done = client.call(ProcessId(1), &pause, timeout).await.unwrap();
        assert!(matches!(done, RpcReply::Done(true)));

        let unroutable = client.call(ProcessId(2), &pause, timeout).await;
        assert!(matches!(unroutable, Err(BrokerError::Unroutable(ProcessId(2)))));

        let Ok(RpcReply::Deferred(deferred)) = client.call(ProcessId(3), &pause, timeout).await else {
            panic!("expected a deferred reply");
        };
        assert_eq!(deferred.await.unwrap(), Ok(true));

        let Ok(RpcReply::Deferred(deferred)) = client.call(ProcessId(4), &pause, timeout).await else {
            panic!("expected a deferred reply");
        };
        assert_eq!(deferred.await.unwrap(), Err("worker crashed".to_string()));
    }

    #[tokio::test]
    async fn test_caller_leaving_after_accepted_is_not_a_failure() {
        let channel = MockChannel::new().reply(7, MockReply::Later(Duration::from_millis(30), Ok(true)));
        let (server, client) = UnixStream::pair().unwrap();
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let connection = tokio::spawn(handle_connection(server, Arc::new(channel), shutdown_tx, "test".to_string()));

        let call = DaemonMessage::Call {
            pid: ProcessId(7),
            action: ProcessAction::kill(None, false),
            timeout_ms: 1_000,
        };
        let (read_half, mut write_half) = client.into_split();
        let line = serde_json::to_string(&call).unwrap();
        write_half.write_all(format!("{line}\n").as_bytes()).await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut accepted = String::new();
        reader.read_line(&mut accepted).await.unwrap();
        assert_eq!(serde_json::from_str::<DaemonResponse>(accepted.trim()).unwrap(), DaemonResponse::Accepted);

        // Fire and forget: hang up before the result arrives
        drop(reader);
        drop(write_half);

        assert!(connection.await.unwrap().is_ok());
    }
}
