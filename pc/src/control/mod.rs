//! Control actions over many processes
//!
//! The Dispatcher sends one action to one process and classifies the
//! answer. The BatchResolver fans an action out over a target list and,
//! when asked to wait, multiplexes the deferred answers. ProcessController
//! is the operator-facing entry point.

mod config;
mod controller;
mod dispatcher;
mod log;
mod outcome;
mod resolver;

pub use config::ControlConfig;
pub use controller::{ProcessController, Targets, WaitPolicy};
pub use dispatcher::Dispatcher;
pub use log::{ActionEvent, ActionLog, EventKind, MemoryLog, TracingLog};
pub use outcome::{ActionFailure, ActionOutcome, BatchReport, ControlError, PendingAction, format_pids};
pub use resolver::BatchResolver;
