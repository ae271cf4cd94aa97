//! Turn states and session events

use std::fmt;

use serde::Serialize;

/// Conversation state of a voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Connected and waiting for the user
    #[default]
    Idle,
    /// Acquiring the microphone and dialing the service
    Connecting,
    /// Capturing and streaming user audio
    Listening,
    /// User turn sent, waiting for the response
    Processing,
    /// Assistant audio is playing
    Speaking,
    /// Playback cut short by the user
    Interrupted,
    /// Device or connection failure; needs `initialize`
    Error,
}

impl TurnState {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }

    /// Whether inbound assistant audio belongs to the current turn
    #[must_use]
    pub const fn accepts_audio(self) -> bool {
        matches!(self, Self::Processing | Self::Speaking)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification published to session observers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Turn state changed
    StateChanged {
        /// Previous state
        from: TurnState,
        /// New state
        to: TurnState,
    },
    /// Assistant text
    Text(String),
    /// A function call was received and dispatched
    FunctionCall {
        /// Function name
        name: String,
    },
    /// Speech confirmed in the user's audio
    SpeechStarted,
    /// The user's utterance closed
    SpeechEnded,
    /// Human-readable failure
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase() {
        assert_eq!(TurnState::Processing.to_string(), "processing");
        assert_eq!(TurnState::default(), TurnState::Idle);
    }

    #[test]
    fn only_active_turn_accepts_audio() {
        assert!(TurnState::Processing.accepts_audio());
        assert!(TurnState::Speaking.accepts_audio());
        assert!(!TurnState::Idle.accepts_audio());
        assert!(!TurnState::Interrupted.accepts_audio());
    }
}
