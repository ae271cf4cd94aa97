//! Error types for the voice turn-taking engine

use thiserror::Error;

use crate::turn::TurnState;

/// Result type alias for voiceturn operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (invalid VAD parameters, bad endpoint, etc.)
    #[error("configuration error: {0}")]
    Config(String),

    /// No microphone, permission denied, or no usable input format
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio stream or playback error
    #[error("audio error: {0}")]
    Audio(String),

    /// Transport channel is not open
    #[error("transport not connected")]
    NotConnected,

    /// Dial, handshake, or socket failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed inbound payload
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No usable ambient sample for calibration
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Command not valid in the current turn state
    #[error("cannot {action} while {state}")]
    InvalidState {
        /// Attempted action
        action: &'static str,
        /// State at the time of the attempt
        state: TurnState,
    },

    /// Session was disposed or its controller task has stopped
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the session can keep running after this error
    ///
    /// Device loss ends the session; everything else leaves VAD and
    /// playback usable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::DeviceUnavailable(_) | Self::SessionClosed)
    }
}
