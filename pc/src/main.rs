//! procctl - process control CLI
//!
//! Entry point for controlling processes and managing the daemon.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, error, info, warn};

use procctl::broker::{Broker, BrokerHandle, ControlChannel, QueueLock};
use procctl::cli::{Cli, Command, ConsoleLog, DaemonCommand, OutputFormat, ProcessCommand, get_log_path};
use procctl::config::{Config, log_dir};
use procctl::control::{BatchReport, ControlError, ProcessController, WaitPolicy};
use procctl::daemon::{DaemonManager, VERSION};
use procctl::domain::{ProcessHandle, ProcessId};
use procctl::ipc::{self, DaemonClient};
use procctl::reconcile::Reconciler;
use procctl::registry::{ProcessFilter, RegistryManager};
use procctl::worker::{TickWorkload, WorkerPool};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = log_dir();
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    // The CLI and the daemon share one file
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("procctl.log"))
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;
    debug!(data_dir = %config.storage.data_dir.display(), "main: config loaded");

    match cli.command {
        Some(Command::Process { command }) => cmd_process(&config, command).await,
        Some(Command::Daemon { command }) => match command {
            DaemonCommand::Start { foreground } => cmd_start(&config, cli.config.as_deref(), foreground).await,
            DaemonCommand::Stop => cmd_stop(&config).await,
            DaemonCommand::Status { format } => cmd_status(&config, format).await,
            DaemonCommand::Ping => cmd_ping(&config).await,
        },
        Some(Command::Logs { follow, lines }) => cmd_logs(follow, lines).await,
        Some(Command::RunDaemon) => cmd_run_daemon(&config).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Stores and channels the control commands work through
struct ControlContext {
    registry: RegistryManager,
    queue: BrokerHandle,
    channel: DaemonClient,
}

impl ControlContext {
    fn open(config: &Config) -> Result<Self> {
        let data_dir = &config.storage.data_dir;
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;

        let registry = RegistryManager::spawn(data_dir).context("Failed to open process registry")?;
        let queue = Broker::open(config.broker.clone(), data_dir)
            .context("Failed to open launch queue")?
            .spawn();
        let channel = DaemonClient::new(ipc::socket_path(data_dir));
        Ok(Self {
            registry,
            queue,
            channel,
        })
    }

    fn controller(&self, config: &Config) -> ProcessController {
        ProcessController::new(
            Arc::new(self.registry.clone()),
            Arc::new(self.channel.clone()),
            Arc::new(self.queue.clone()),
            config.control.rpc_timeout(),
        )
        .with_log(Arc::new(ConsoleLog::new()))
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::new(self.registry.clone()), Arc::new(self.queue.clone()))
    }
}

async fn cmd_process(config: &Config, command: ProcessCommand) -> Result<()> {
    let ctx = ControlContext::open(config)?;
    let controller = ctx.controller(config);
    let control = &config.control;

    match command {
        ProcessCommand::Kill {
            targets,
            message,
            force,
            wait,
        } => {
            let (wait, timeout) = wait.resolve(control.wait, control.timeout());
            let result = controller
                .kill(targets.targets(), message, force, WaitPolicy::new(wait, timeout))
                .await;
            print_batch(result, "kill")
        }
        ProcessCommand::Pause { targets, message, wait } => {
            let (wait, timeout) = wait.resolve(control.wait, control.timeout());
            let result = controller
                .pause(targets.targets(), message, WaitPolicy::new(wait, timeout))
                .await;
            print_batch(result, "pause")
        }
        ProcessCommand::Play { targets, wait } => {
            let (wait, timeout) = wait.resolve(control.wait, control.timeout());
            let result = controller.play(targets.targets(), WaitPolicy::new(wait, timeout)).await;
            print_batch(result, "play")
        }
        ProcessCommand::Repair { dry_run, format } => cmd_repair(config, &ctx, dry_run, format).await,
        ProcessCommand::Revive { ids } => {
            let ids: Vec<ProcessId> = ids.into_iter().map(ProcessId).collect();
            let revived = controller.revive(&ids).await?;
            for (pid, tag) in &revived {
                println!("Revived Process<{}> (task {})", pid, tag);
            }
            if revived.len() < ids.len() {
                println!("{} of {} processes were not revived, see the log", ids.len() - revived.len(), ids.len());
            }
            Ok(())
        }
        ProcessCommand::Launch { label } => {
            let (process, tag) = controller.launch(label).await?;
            println!("Launched Process<{}> (task {})", process.id, tag);
            if !ctx.channel.socket_exists() {
                println!("The daemon is not running; start it with `pc daemon start`");
            }
            Ok(())
        }
        ProcessCommand::List { all, format } => {
            let filter = if all { ProcessFilter::all() } else { ProcessFilter::active(None) };
            let processes = ctx.registry.list_processes(filter).await?;
            print_processes(&processes, format)
        }
        ProcessCommand::Tasks { format } => {
            let tasks = controller.tasks().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
                OutputFormat::Text => {
                    if tasks.is_empty() {
                        println!("No outstanding launch tasks");
                    }
                    for task in &tasks {
                        println!("{:>8}  Process<{}>", task.delivery_tag.to_string(), task.target_id);
                    }
                }
            }
            Ok(())
        }
    }
}

/// Print the batch summary; a batch timeout is fatal
fn print_batch(result: Result<BatchReport, ControlError>, verb: &str) -> Result<()> {
    match result {
        Ok(report) => {
            let total = report.succeeded.len() + report.scheduled.len() + report.failures.len() + report.skipped.len();
            if total == 0 {
                println!("No processes to {}", verb);
            } else {
                println!("{}", report);
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "{} failed", verb);
            Err(e.into())
        }
    }
}

fn print_processes(processes: &[ProcessHandle], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(processes)?),
        OutputFormat::Text => {
            if processes.is_empty() {
                println!("No processes");
                return Ok(());
            }
            println!("{:>6}  {:<9}  {:<6}  {:<20}  MESSAGE", "PID", "STATE", "PAUSED", "LABEL");
            for p in processes {
                println!(
                    "{:>6}  {:<9}  {:<6}  {:<20}  {}",
                    p.id.to_string(),
                    p.state.to_string(),
                    if p.paused { "yes" } else { "no" },
                    p.label.as_deref().unwrap_or("-"),
                    p.status_message.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

async fn cmd_repair(config: &Config, ctx: &ControlContext, dry_run: bool, format: OutputFormat) -> Result<()> {
    let reconciler = ctx.reconciler();

    if dry_run {
        let report = reconciler.inspect().await?;
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => print!("{}", report),
        }
        return Ok(());
    }

    let data_dir = &config.storage.data_dir;
    if let Some(pid) = DaemonManager::new(data_dir).running_pid() {
        return Err(eyre::eyre!(
            "The daemon is running (PID {}). Stop it with `pc daemon stop` before repairing",
            pid
        ));
    }
    let guard = QueueLock::new(data_dir)
        .exclusive()
        .context("The launch queue is being consumed; stop every daemon before repairing")?;

    let outcome = reconciler.repair(&guard).await?;
    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "report": outcome.report,
                "discarded": outcome.discarded,
                "revived": outcome.revived,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            print!("{}", outcome.report);
            for tag in &outcome.discarded {
                println!("Discarded task {}", tag);
            }
            for pid in &outcome.revived {
                println!("Revived Process<{}>", pid);
            }
            if !outcome.report.is_consistent() {
                println!("Repair complete");
            }
        }
    }
    Ok(())
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<&Path>, foreground: bool) -> Result<()> {
    let daemon = DaemonManager::new(&config.storage.data_dir);

    if let Some(pid) = daemon.running_pid() {
        println!("procctl daemon is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting procctl daemon in foreground mode...");
        daemon.register_self()?;
        let result = run_daemon(config).await;
        daemon.unregister_self()?;
        result
    } else {
        let pid = daemon.start(config_path)?;
        println!("procctl daemon started (PID: {})", pid);
        Ok(())
    }
}

/// Stop the daemon
async fn cmd_stop(config: &Config) -> Result<()> {
    let daemon = DaemonManager::new(&config.storage.data_dir);

    let Some(pid) = daemon.running_pid() else {
        println!("procctl daemon is not running");
        return Ok(());
    };

    daemon.stop()?;
    println!("procctl daemon stopped (was PID: {})", pid);
    Ok(())
}

/// Show daemon status
async fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    let daemon = DaemonManager::new(&config.storage.data_dir);
    let status = daemon.status();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "version": status.version,
                "pid_file": status.pid_file.to_string_lossy(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("procctl daemon status");
            println!("---------------------");
            match status.pid {
                Some(pid) => {
                    println!("Status: running");
                    println!("PID: {}", pid);
                    if let Some(version) = &status.version {
                        println!("Version: {}", version);
                        if version != VERSION {
                            println!("Warning: daemon version differs from this CLI ({})", VERSION);
                        }
                    }
                }
                None => println!("Status: stopped"),
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }

    Ok(())
}

async fn cmd_ping(config: &Config) -> Result<()> {
    let client = DaemonClient::new(ipc::socket_path(&config.storage.data_dir));
    if !client.socket_exists() {
        println!("procctl daemon is not running");
        return Ok(());
    }
    let version = client.ping().await.context("Daemon did not answer")?;
    println!("pong (daemon version {})", version);
    Ok(())
}

/// Show logs
async fn cmd_logs(follow: bool, lines: usize) -> Result<()> {
    let log_path = get_log_path();

    if !log_path.exists() {
        println!("No log file found at: {}", log_path.display());
        return Ok(());
    }

    if follow {
        println!("Following log file: {} (Ctrl+C to stop)", log_path.display());
        println!();

        let mut child = std::process::Command::new("tail")
            .args(["-f", "-n", &lines.to_string()])
            .arg(&log_path)
            .spawn()
            .context("Failed to run tail -f")?;

        child.wait()?;
    } else {
        let file = fs::File::open(&log_path).context("Failed to open log file")?;
        let reader = BufReader::new(file);
        let all_lines: Vec<String> = reader.lines().map_while(Result::ok).collect();

        let start = all_lines.len().saturating_sub(lines);
        for line in &all_lines[start..] {
            println!("{}", line);
        }
    }

    Ok(())
}

/// Run as the daemon process (internal command)
async fn cmd_run_daemon(config: &Config) -> Result<()> {
    let daemon = DaemonManager::new(&config.storage.data_dir);
    daemon.register_self()?;

    let result = run_daemon(config).await;
    if let Err(e) = &result {
        error!(error = %e, "Daemon exited with error");
    }
    daemon.unregister_self()?;
    result
}

/// Run the daemon main loop
async fn run_daemon(config: &Config) -> Result<()> {
    info!(version = VERSION, "Daemon starting...");

    let data_dir = &config.storage.data_dir;
    fs::create_dir_all(data_dir).context("Failed to create data directory")?;

    // Held for the daemon's lifetime; repair needs it exclusively
    let _queue_guard = QueueLock::new(data_dir)
        .consume()
        .context("Another daemon is consuming the launch queue")?;

    let mut broker = Broker::open(config.broker.clone(), data_dir).context("Failed to open launch queue")?;
    let released = broker.release_held()?;
    if released > 0 {
        warn!(released, "Returned tasks held by a previous daemon to the queue");
    }
    let broker = broker.spawn();
    info!("Broker started");

    let registry = RegistryManager::spawn(data_dir).context("Failed to open process registry")?;
    info!("RegistryManager initialized");

    let socket_path = ipc::socket_path(data_dir);
    let (listener, socket_path) = ipc::create_listener_at(&socket_path)?;
    let (ipc_shutdown_tx, mut ipc_shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let channel: Arc<dyn ControlChannel> = Arc::new(broker.clone());
    let ipc_handle = tokio::spawn(ipc::serve(listener, channel, ipc_shutdown_tx, VERSION.to_string()));
    info!(socket = %socket_path.display(), "IPC listener started");

    let workload = Arc::new(TickWorkload::new(config.worker.steps));
    let mut pool = WorkerPool::new(config.worker.clone(), registry.clone(), broker.clone(), workload);
    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let pool_handle = tokio::spawn(async move {
        if let Err(e) = pool.run(shutdown_rx).await {
            error!(error = %e, "WorkerPool error");
        }
    });
    info!("WorkerPool started");

    info!("Daemon running. Send SIGTERM or run `pc daemon stop` to stop.");

    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
            _ = ipc_shutdown_rx.recv() => info!("Shutdown requested over IPC"),
        }
    }

    info!("Daemon shutting down...");

    // Runners stop and release their tasks before the broker goes away
    let _ = shutdown_tx.send(()).await;
    let _ = pool_handle.await;

    ipc_handle.abort();
    ipc::cleanup_socket(&socket_path);

    if let Err(e) = broker.shutdown().await {
        warn!(error = %e, "Broker shutdown failed");
    }
    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Registry shutdown failed");
    }

    info!("Daemon stopped");
    Ok(())
}
