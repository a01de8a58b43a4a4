//! Inter-Process Communication between the CLI and the daemon
//!
//! Unix Domain Socket carrying newline-delimited JSON. The CLI uses it to
//! reach the daemon's broker: control calls go in, worker answers come back.

use std::path::{Path, PathBuf};

pub mod client;
pub mod listener;
pub mod messages;

pub use client::DaemonClient;
pub use listener::{cleanup_socket, create_listener_at, read_message, send_response, serve};
pub use messages::{DaemonMessage, DaemonResponse};

/// Maximum message size
pub(crate) const MAX_MESSAGE_SIZE: usize = 4096;

/// Socket path for daemon IPC inside the data directory
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_daemon_sock() {
        let path = socket_path(Path::new("/var/lib/procctl"));
        assert!(path.ends_with("procctl/daemon.sock"));
    }
}
