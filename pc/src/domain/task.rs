//! Launch-queue task types

use serde::{Deserialize, Serialize};

use super::ProcessId;

/// Broker reference used to acknowledge or requeue a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(pub i64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// JSON body of a launch task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Task kind; only "continue" is published by this crate
    pub task: String,
    /// Process the task refers to
    pub pid: ProcessId,
    /// Publisher does not wait for the worker to pick the task up
    #[serde(default = "default_nowait")]
    pub nowait: bool,
}

fn default_nowait() -> bool {
    true
}

impl TaskPayload {
    /// A "continue" task for the given process
    pub fn continue_process(pid: ProcessId) -> Self {
        Self {
            task: "continue".to_string(),
            pid,
            nowait: true,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// An outstanding launch-queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Process this task refers to
    pub target_id: ProcessId,
    /// Broker handle for acknowledge / requeue
    pub delivery_tag: DeliveryTag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_payload_body() {
        let payload = TaskPayload::continue_process(ProcessId(12));
        let body = payload.encode().unwrap();
        assert_eq!(body, r#"{"task":"continue","pid":12,"nowait":true}"#);
    }

    #[test]
    fn test_decode_defaults_nowait() {
        let payload = TaskPayload::decode(r#"{"task":"continue","pid":4}"#).unwrap();
        assert_eq!(payload.pid, ProcessId(4));
        assert!(payload.nowait);
    }

    #[test]
    fn test_decode_rejects_missing_pid() {
        assert!(TaskPayload::decode(r#"{"task":"continue"}"#).is_err());
        assert!(TaskPayload::decode("not json").is_err());
    }
}
