//! Control actions sent to running processes

use serde::{Deserialize, Serialize};

/// A control action addressed to one process
///
/// Every verb travels through the same RPC path; the variant carries the
/// verb-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum ProcessAction {
    /// Terminate the process
    Kill {
        #[serde(default)]
        message: Option<String>,
        /// Do not wait for the current step to finish
        #[serde(default)]
        force: bool,
    },
    /// Suspend the process at its next step boundary
    Pause {
        #[serde(default)]
        message: Option<String>,
    },
    /// Resume a paused process
    Play,
    /// Ask the owning worker to continue the process
    Continue,
}

impl ProcessAction {
    pub fn kill(message: Option<String>, force: bool) -> Self {
        Self::Kill { message, force }
    }

    pub fn pause(message: Option<String>) -> Self {
        Self::Pause { message }
    }

    /// Verb as used in "about to" phrasing
    pub fn infinitive(&self) -> &'static str {
        match self {
            Self::Kill { .. } => "kill",
            Self::Pause { .. } => "pause",
            Self::Play => "play",
            Self::Continue => "continue",
        }
    }

    /// Verb as used in "in progress" phrasing
    pub fn present(&self) -> &'static str {
        match self {
            Self::Kill { .. } => "killing",
            Self::Pause { .. } => "pausing",
            Self::Play => "playing",
            Self::Continue => "continuing",
        }
    }

    /// Verb as used in "completed" phrasing
    pub fn past(&self) -> &'static str {
        match self {
            Self::Kill { .. } => "killed",
            Self::Pause { .. } => "paused",
            Self::Play => "played",
            Self::Continue => "continued",
        }
    }

    /// Message attached to the action, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Kill { message, .. } | Self::Pause { message } => message.as_deref(),
            Self::Play | Self::Continue => None,
        }
    }
}

impl std::fmt::Display for ProcessAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.infinitive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenses() {
        let kill = ProcessAction::kill(None, false);
        assert_eq!(
            (kill.infinitive(), kill.present(), kill.past()),
            ("kill", "killing", "killed")
        );
        let play = ProcessAction::Play;
        assert_eq!((play.infinitive(), play.present(), play.past()), ("play", "playing", "played"));
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let action = ProcessAction::kill(Some("operator request".to_string()), true);
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(json, r#"{"verb":"kill","message":"operator request","force":true}"#);

        let parsed: ProcessAction = serde_json::from_str(r#"{"verb":"pause"}"#).unwrap();
        assert_eq!(parsed, ProcessAction::pause(None));
    }

    #[test]
    fn test_message_accessor() {
        assert_eq!(ProcessAction::pause(Some("hold".to_string())).message(), Some("hold"));
        assert_eq!(ProcessAction::Play.message(), None);
    }
}
