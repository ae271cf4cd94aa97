//! Configuration management for voiceturn
//!
//! Values are layered env > TOML file > defaults.

pub mod file;

use std::time::Duration;

use url::Url;

use crate::transport::{DEFAULT_HANDSHAKE_TIMEOUT, InitParams, endpoint_url};
use crate::turn::{CALIBRATION_DEADLINE, DEFAULT_FRAME_QUEUE_DEPTH, TurnSettings};
use crate::vad::{Environment, VadConfig};
use crate::voice::{FRAME_SIZE, SAMPLE_RATE};
use crate::{Error, Result};

use file::ConfigFile;

/// voiceturn configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Voice service connection
    pub server: ServerConfig,

    /// Session identity
    pub session: SessionConfig,

    /// Capture and detection tuning
    pub audio: AudioConfig,
}

/// Voice service connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Base URL of the voice service
    pub url: String,

    /// Feature path segment
    pub feature: String,

    /// Bound on dial plus handshake
    pub handshake_timeout: Duration,
}

/// Session identity sent in `init`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Tenant id
    pub tenant_id: String,

    /// Restaurant display name
    pub restaurant_name: String,

    /// Assistant voice
    pub voice_preset: String,

    /// Training module
    pub module: String,
}

/// Capture and detection tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Acoustic environment preset
    pub environment: Environment,

    /// Samples per frame
    pub frame_size: usize,

    /// Frames buffered between capture and controller
    pub frame_queue_depth: usize,

    /// Ambient audio collected by calibration
    pub calibration: Duration,

    /// Interrupt playback when the user starts talking
    pub auto_barge_in: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                url: "ws://localhost:8080".to_string(),
                feature: "voice-training".to_string(),
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            },
            session: SessionConfig {
                tenant_id: "default".to_string(),
                restaurant_name: "Restaurant".to_string(),
                voice_preset: "default".to_string(),
                module: "onboarding".to_string(),
            },
            audio: AudioConfig {
                environment: Environment::Auto,
                frame_size: FRAME_SIZE,
                frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
                calibration: Duration::from_secs(1),
                auto_barge_in: false,
            },
        }
    }
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an invalid value
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Layer `env` over `fc` over defaults
    ///
    /// # Errors
    ///
    /// Returns error if an environment value cannot be parsed
    pub fn from_sources(fc: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let server = ServerConfig {
            url: env("VOICETURN_SERVER_URL")
                .or(fc.server.url)
                .unwrap_or(defaults.server.url),
            feature: env("VOICETURN_FEATURE")
                .or(fc.server.feature)
                .unwrap_or(defaults.server.feature),
            handshake_timeout: fc
                .server
                .handshake_timeout_secs
                .map_or(defaults.server.handshake_timeout, Duration::from_secs),
        };

        let session = SessionConfig {
            tenant_id: env("VOICETURN_TENANT_ID")
                .or(fc.session.tenant_id)
                .unwrap_or(defaults.session.tenant_id),
            restaurant_name: env("VOICETURN_RESTAURANT_NAME")
                .or(fc.session.restaurant_name)
                .unwrap_or(defaults.session.restaurant_name),
            voice_preset: env("VOICETURN_VOICE_PRESET")
                .or(fc.session.voice_preset)
                .unwrap_or(defaults.session.voice_preset),
            module: env("VOICETURN_MODULE")
                .or(fc.session.module)
                .unwrap_or(defaults.session.module),
        };

        let environment = match env("VOICETURN_ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => fc.audio.environment.unwrap_or(defaults.audio.environment),
        };

        let auto_barge_in = match env("VOICETURN_AUTO_BARGE_IN") {
            Some(value) => parse_bool(&value).ok_or_else(|| {
                Error::Config(format!("VOICETURN_AUTO_BARGE_IN is not a boolean: {value}"))
            })?,
            None => fc.audio.auto_barge_in.unwrap_or(defaults.audio.auto_barge_in),
        };

        let audio = AudioConfig {
            environment,
            frame_size: fc.audio.frame_size.unwrap_or(defaults.audio.frame_size),
            frame_queue_depth: fc
                .audio
                .frame_queue_depth
                .unwrap_or(defaults.audio.frame_queue_depth),
            calibration: fc
                .audio
                .calibration_ms
                .map_or(defaults.audio.calibration, Duration::from_millis),
            auto_barge_in,
        };

        let config = Self {
            server,
            session,
            audio,
        };
        tracing::debug!(
            url = %config.server.url,
            environment = %config.audio.environment,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Parameters for the `init` message
    #[must_use]
    pub fn init_params(&self) -> InitParams {
        InitParams {
            voice_preset: self.session.voice_preset.clone(),
            module: self.session.module.clone(),
            tenant_id: self.session.tenant_id.clone(),
            restaurant_name: self.session.restaurant_name.clone(),
        }
    }

    /// Detector configuration
    #[must_use]
    pub const fn vad_config(&self) -> VadConfig {
        VadConfig {
            environment: self.audio.environment,
            frame_size: self.audio.frame_size,
            sample_rate: SAMPLE_RATE,
            params: None,
        }
    }

    /// Controller settings
    #[must_use]
    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            init: self.init_params(),
            vad: self.vad_config(),
            frame_queue_depth: self.audio.frame_queue_depth,
            calibration_window: self.audio.calibration,
            calibration_deadline: CALIBRATION_DEADLINE.max(self.audio.calibration),
            auto_barge_in: self.audio.auto_barge_in,
        }
    }

    /// Endpoint for a session
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the server URL or identity is invalid
    pub fn endpoint(&self, session_id: &str) -> Result<Url> {
        endpoint_url(
            &self.server.url,
            &self.server.feature,
            &self.session.tenant_id,
            session_id,
        )
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
