//! IPC message types for daemon communication
//!
//! Simple JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.

use serde::{Deserialize, Serialize};

use crate::domain::{ProcessAction, ProcessId};

/// Messages from CLI to Daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Ping to check if daemon is alive
    Ping,

    /// Forward a control action to the worker owning `pid`
    Call {
        pid: ProcessId,
        action: ProcessAction,
        timeout_ms: u64,
    },

    /// Request daemon to stop gracefully
    Shutdown,
}

/// Responses from Daemon to CLI
///
/// A `Call` gets exactly one of `Done`, `Accepted`, `Unroutable`, `TimedOut`
/// or `Error`. After `Accepted` the connection stays open for one more
/// line: `Resolved` or `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    /// Acknowledgment
    Ok,

    /// Pong response to ping
    Pong { version: String },

    /// The worker answered synchronously
    Done { result: bool },

    /// The worker accepted; a second line follows
    Accepted,

    /// Final result of an accepted call
    Resolved { result: bool },

    /// An accepted call could not be completed
    Failed { message: String },

    /// No worker owns the process
    Unroutable,

    /// The worker did not answer in time
    TimedOut,

    /// Error response
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_serialize() {
        let msg = DaemonMessage::Ping;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"Ping"}"#);
    }

    #[test]
    fn test_call_serialize() {
        let msg = DaemonMessage::Call {
            pid: ProcessId(12),
            action: ProcessAction::pause(None),
            timeout_ms: 500,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"Call","pid":12,"action":{"verb":"pause","message":null},"timeout_ms":500}"#
        );
    }

    #[test]
    fn test_call_deserialize_without_optional_fields() {
        let json = r#"{"type":"Call","pid":3,"action":{"verb":"kill"},"timeout_ms":100}"#;
        let msg: DaemonMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            DaemonMessage::Call {
                pid: ProcessId(3),
                action: ProcessAction::kill(None, false),
                timeout_ms: 100,
            }
        );
    }

    #[test]
    fn test_pong_response_serialize() {
        let resp = DaemonResponse::Pong {
            version: "1.0.0".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"Pong","version":"1.0.0"}"#);
    }

    #[test]
    fn test_call_responses_serialize() {
        let cases = [
            (DaemonResponse::Done { result: true }, r#"{"type":"Done","result":true}"#),
            (DaemonResponse::Accepted, r#"{"type":"Accepted"}"#),
            (DaemonResponse::Resolved { result: false }, r#"{"type":"Resolved","result":false}"#),
            (DaemonResponse::Unroutable, r#"{"type":"Unroutable"}"#),
        ];
        for (resp, expected) in cases {
            assert_eq!(serde_json::to_string(&resp).unwrap(), expected);
        }
    }
}
