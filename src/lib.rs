//! voiceturn - Real-time voice turn-taking engine
//!
//! This library drives a spoken conversation with a remote voice assistant:
//! - Microphone capture into fixed-size frames
//! - Adaptive voice activity detection with environment presets
//! - PCM16/base64 encoding and a tagged WebSocket protocol
//! - Ordered, interruptible playback of assistant audio
//! - Function call routing to host handlers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  frames  ┌────────────────────────────┐  json   ┌───────────┐
//! │ FrameSource  ├─────────►│       TurnController       ├────────►│ Transport │
//! │ (cpal mic)   │          │  VAD · state machine ·     │◄────────┤ (ws)      │
//! └──────────────┘          │  pre-roll · end of turn    │         └───────────┘
//!                           └──────┬─────────────┬───────┘
//!                                  │ chunks      │ calls
//!                           ┌──────▼───────┐ ┌───▼─────────────────────┐
//!                           │PlaybackBuffer│ │ FunctionCallDispatcher  │
//!                           └──────────────┘ └─────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod turn;
pub mod vad;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use session::VoiceSession;
pub use transport::{ClientMessage, InitParams, StreamMessage, StreamingTransport, Transport};
pub use turn::{
    FunctionCallDispatcher, SessionEvent, TurnController, TurnHandle, TurnSettings, TurnState,
};
pub use vad::{CalibrationProfile, Environment, VadConfig, VadParams, VoiceActivityDetector};
pub use voice::{AudioChunk, AudioFrame, AudioSink, FrameSource, PlaybackBuffer};
