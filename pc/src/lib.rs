//! procctl - process control for daemon-supervised processes
//!
//! Processes are recorded in a durable registry and driven by a daemon that
//! consumes a launch queue. Operators kill, pause and play them through RPC
//! addressed by process id, and repair the queue when it drifts from the
//! registry.
//!
//! # Modules
//!
//! - [`domain`] - Process, action and task types
//! - [`registry`] - SQLite-backed process registry (actor)
//! - [`broker`] - RPC routing and the durable launch queue (actor)
//! - [`control`] - Dispatching actions and resolving batches
//! - [`reconcile`] - Registry/queue consistency checks and repair
//! - [`worker`] - Daemon-side process runners
//! - [`ipc`] - CLI to daemon socket protocol
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod broker;
pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod domain;
pub mod ipc;
pub mod reconcile;
pub mod registry;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, BrokerConfig, BrokerError, BrokerHandle, ControlChannel, QueueLock, RpcReply, TaskQueue};
pub use config::Config;
pub use control::{
    ActionEvent, ActionLog, BatchReport, ControlConfig, ControlError, ProcessController, Targets, WaitPolicy,
};
pub use domain::{DeliveryTag, ProcessAction, ProcessHandle, ProcessId, ProcessState, TaskPayload, TaskRecord};
pub use reconcile::{ReconcileError, Reconciler, ReconciliationReport, RepairOutcome, Snapshot, classify};
pub use registry::{ProcessRegistry, RegistryError, RegistryManager};
pub use worker::{TickWorkload, WorkerConfig, WorkerPool, Workload};
