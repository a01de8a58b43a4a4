//! What a process does on each step

use async_trait::async_trait;

use crate::domain::ProcessHandle;

/// Result of advancing a process by one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Finished,
}

/// The per-step logic of a process
///
/// The control plane only needs step boundaries: pause and kill take
/// effect between two calls to `step`. An `Err` marks the process excepted.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn step(&self, process: &ProcessHandle, step: u64) -> Result<StepOutcome, String>;
}

/// Counts steps and finishes after a fixed number
#[derive(Debug, Clone, Copy)]
pub struct TickWorkload {
    /// 0 never finishes
    pub steps: u64,
}

impl TickWorkload {
    pub fn new(steps: u64) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Workload for TickWorkload {
    async fn step(&self, _process: &ProcessHandle, step: u64) -> Result<StepOutcome, String> {
        if self.steps != 0 && step + 1 >= self.steps {
            Ok(StepOutcome::Finished)
        } else {
            Ok(StepOutcome::Continue)
        }
    }
}
