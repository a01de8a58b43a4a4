//! CLI command definitions and subcommands

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::debug;

use crate::control::{ActionEvent, ActionLog, EventKind, Targets, TracingLog};
use crate::domain::ProcessId;

/// procctl - control processes supervised by the procctl daemon
#[derive(Parser)]
#[command(
    name = "pc",
    about = "Kill, pause, play and repair daemon-supervised processes",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/procctl/logs/procctl.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Control processes
    Process {
        #[command(subcommand)]
        command: ProcessCommand,
    },

    /// Manage the procctl daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Show daemon logs
    Logs {
        /// Follow log output (like tail -f)
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,
}

/// Process ids, or every applicable process
#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Process ids
    #[arg(value_name = "PID", required_unless_present = "all", conflicts_with = "all")]
    pub ids: Vec<u64>,

    /// Apply to every applicable process
    #[arg(short, long)]
    pub all: bool,
}

impl TargetArgs {
    pub fn targets(&self) -> Targets {
        if self.all {
            Targets::All
        } else {
            Targets::Ids(self.ids.iter().copied().map(ProcessId).collect())
        }
    }
}

/// Wait behavior for control commands
#[derive(Debug, Args)]
pub struct WaitArgs {
    /// Wait for scheduled actions to take effect
    #[arg(short, long, conflicts_with = "no_wait")]
    pub wait: bool,

    /// Do not wait, even if the config says so
    #[arg(long)]
    pub no_wait: bool,

    /// Seconds a waiting batch tolerates no progress
    #[arg(short, long, value_name = "SECONDS", value_parser = parse_timeout)]
    pub timeout: Option<f64>,
}

/// Accept only positive second counts that fit in a `Duration`
fn parse_timeout(value: &str) -> Result<f64, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{e}"))?;
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if !duration.is_zero() => Ok(seconds),
        Ok(_) => Err("timeout must be greater than zero".to_string()),
        Err(e) => Err(format!("timeout out of range: {e}")),
    }
}

impl WaitArgs {
    /// Resolve against the configured defaults
    pub fn resolve(&self, default_wait: bool, default_timeout: Duration) -> (bool, Duration) {
        let wait = self.wait || (default_wait && !self.no_wait);
        let timeout = self
            .timeout
            .and_then(|t| Duration::try_from_secs_f64(t).ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(default_timeout);
        (wait, timeout)
    }
}

/// Process control subcommands
#[derive(Debug, Subcommand)]
pub enum ProcessCommand {
    /// Kill processes
    Kill {
        #[command(flatten)]
        targets: TargetArgs,

        /// Reason recorded on the killed process
        #[arg(short, long)]
        message: Option<String>,

        /// Kill without waiting for the next step boundary
        #[arg(short, long)]
        force: bool,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Pause running processes
    Pause {
        #[command(flatten)]
        targets: TargetArgs,

        /// Reason recorded on the paused process
        #[arg(short, long)]
        message: Option<String>,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Resume paused processes
    Play {
        #[command(flatten)]
        targets: TargetArgs,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Compare active processes with the launch queue and fix differences
    Repair {
        /// Only report inconsistencies
        #[arg(long)]
        dry_run: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Publish a new launch task for processes that lost theirs
    Revive {
        /// Process ids
        #[arg(value_name = "PID", required = true)]
        ids: Vec<u64>,
    },

    /// Create a process and queue it for the daemon
    Launch {
        /// Free-form label
        #[arg(long)]
        label: Option<String>,
    },

    /// List processes
    List {
        /// Include terminated processes
        #[arg(short, long)]
        all: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List outstanding launch tasks
    Tasks {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Daemon management subcommands
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the daemon
    Stop,

    /// Check daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ping the daemon to check if it's alive and responsive
    Ping,
}

/// Path of the log file shared by the CLI and the daemon
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    crate::config::log_dir().join("procctl.log")
}

/// Output format for listing commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Prints each outcome to the terminal and forwards it to the log file
#[derive(Debug, Default)]
pub struct ConsoleLog {
    tracing: TracingLog,
}

impl ConsoleLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal line for an event
    pub fn render(event: &ActionEvent) -> String {
        let line = event.to_string();
        match event.kind() {
            EventKind::Success => format!("{} {}", "Success:".green().bold(), line),
            EventKind::Pending => format!("{} {}", "Report:".blue().bold(), line),
            EventKind::Skipped => format!("{} {}", "Warning:".yellow().bold(), line),
            EventKind::Failure => format!("{} {}", "Error:".red().bold(), line),
        }
    }
}

impl ActionLog for ConsoleLog {
    fn record(&self, event: &ActionEvent) {
        self.tracing.record(event);
        match event.kind() {
            EventKind::Failure => eprintln!("{}", Self::render(event)),
            _ => println!("{}", Self::render(event)),
        }
    }
}
