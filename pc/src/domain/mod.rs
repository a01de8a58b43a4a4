//! Domain types for procctl
//!
//! Core domain types: ProcessHandle, TaskRecord, ProcessAction.
//! The registry persists ProcessHandles; the broker's launch queue carries
//! TaskRecords; control calls carry ProcessActions.

mod action;
mod process;
mod task;

pub use action::ProcessAction;
pub use process::{ProcessHandle, ProcessId, ProcessState};
pub use task::{DeliveryTag, TaskPayload, TaskRecord};

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
