//! Daemon process management
//!
//! Handles daemonization, PID file management, and process control.
//! The PID file doubles as the guard that keeps `process repair` from
//! running while the daemon consumes the launch queue.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// Current version (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const PID_FILE: &str = "procctl.pid";

/// How long `stop` waits for a graceful exit before SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
    /// Written next to the PID file by the daemon itself
    version_file: PathBuf,
}

impl DaemonManager {
    /// Create a daemon manager keeping its files in `data_dir`
    pub fn new(data_dir: &Path) -> Self {
        Self::with_pid_file(data_dir.join(PID_FILE))
    }

    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        let version_file = pid_file.with_extension("version");
        Self { pid_file, version_file }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the daemon, if its PID file names a live process
    pub fn running_pid(&self) -> Option<u32> {
        self.recorded_pid().filter(|&pid| process_alive(pid))
    }

    fn recorded_pid(&self) -> Option<u32> {
        read_marker(&self.pid_file)?.parse().ok()
    }

    /// Version the daemon registered on startup
    pub fn read_version(&self) -> Option<String> {
        read_marker(&self.version_file)
    }

    /// True when the registered daemon was built from this version
    pub fn version_matches(&self) -> bool {
        self.read_version().is_some_and(|v| v == VERSION)
    }

    /// Spawn `run-daemon` as a detached child and record its PID
    pub fn start(&self, config_path: Option<&Path>) -> Result<u32> {
        debug!(?config_path, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to locate the pc executable")?;
        let mut command = Command::new(exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        let child = command
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        write_marker(&self.pid_file, &pid.to_string())?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// SIGTERM the daemon, then SIGKILL it if it outlives the grace period
    pub fn stop(&self) -> Result<()> {
        debug!("DaemonManager::stop: called");
        let pid = self
            .running_pid()
            .ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon");
        send_signal(pid, Some(Signal::SIGTERM)).context("Failed to send SIGTERM")?;

        if !wait_for_exit(pid, STOP_GRACE) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = send_signal(pid, Some(Signal::SIGKILL));
        }

        self.clear_markers()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Record the current process as the daemon
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        write_marker(&self.pid_file, &pid.to_string())?;
        write_marker(&self.version_file, VERSION)?;
        info!(pid, version = VERSION, "Daemon registered");
        Ok(())
    }

    /// Remove the markers on a clean exit, unless another daemon took over
    pub fn unregister_self(&self) -> Result<()> {
        if self.recorded_pid() == Some(std::process::id()) {
            self.clear_markers()?;
        }
        Ok(())
    }

    fn clear_markers(&self) -> Result<()> {
        remove_marker(&self.pid_file)?;
        remove_marker(&self.version_file)
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
            version: pid.and_then(|_| self.read_version()),
        }
    }
}

/// Trimmed contents of a marker file; None when absent or unreadable
fn read_marker(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn write_marker(path: &Path, contents: &str) -> Result<()> {
    debug!(?path, contents, "write_marker: called");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// `None` checks for existence without delivering anything
fn send_signal(pid: u32, signal: Option<Signal>) -> nix::Result<()> {
    kill(Pid::from_raw(pid as i32), signal)
}

fn process_alive(pid: u32) -> bool {
    send_signal(pid, None).is_ok()
}

/// Poll until `pid` exits; false if it is still alive after `grace`
fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    true
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
    /// Version the running daemon registered
    pub version: Option<String>,
}
