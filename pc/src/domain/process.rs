//! ProcessHandle domain type
//!
//! A unit of work under daemon supervision, as recorded in the registry.

use serde::{Deserialize, Serialize};

use super::now_ms;

/// Process identifier, stable for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u64);

impl ProcessId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ProcessId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for ProcessId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| format!("Invalid process id: {}", s))
    }
}

/// Process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Scheduled, not yet picked up by a worker
    #[default]
    Created,
    /// Waiting on an external event
    Waiting,
    /// Actively stepping on a worker
    Running,
    /// Completed normally
    Finished,
    /// Terminated by an unhandled error
    Excepted,
    /// Terminated by a kill action
    Killed,
}

impl ProcessState {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Excepted | Self::Killed)
    }

    /// All non-terminal states
    pub fn active() -> [ProcessState; 3] {
        [Self::Created, Self::Waiting, Self::Running]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Excepted => "excepted",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "excepted" => Ok(Self::Excepted),
            "killed" => Ok(Self::Killed),
            _ => Err(format!("Unknown process state: {}", s)),
        }
    }
}

/// A process as recorded in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// Unique identifier
    pub id: ProcessId,

    /// Current lifecycle state
    pub state: ProcessState,

    /// Paused flag, orthogonal to state
    pub paused: bool,

    /// Free-form label for display
    #[serde(default)]
    pub label: Option<String>,

    /// Last control message (kill or pause reason)
    #[serde(default)]
    pub status_message: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl ProcessHandle {
    /// Create a new process in the Created state
    pub fn new(id: impl Into<ProcessId>) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            state: ProcessState::Created,
            paused: false,
            label: None,
            status_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Builder method to set the state
    pub fn with_state(mut self, state: ProcessState) -> Self {
        self.state = state;
        self
    }

    /// Builder method to set the paused flag
    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Update the state
    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
        self.updated_at = now_ms();
    }

    /// Update the paused flag
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.updated_at = now_ms();
    }

    /// Record a control message
    pub fn set_status_message(&mut self, message: Option<String>) {
        self.status_message = message;
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}
