//! TOML configuration file loading
//!
//! Supports `~/.config/voiceturn/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::Result;
use crate::vad::Environment;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Voice service connection
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Session identity sent in `init`
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Capture and detection tuning
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Voice service connection
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Base URL (e.g. "wss://voice.example.com")
    pub url: Option<String>,

    /// Feature path segment (e.g. "training")
    pub feature: Option<String>,

    /// Seconds allowed for dial plus handshake
    pub handshake_timeout_secs: Option<u64>,
}

/// Session identity
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub tenant_id: Option<String>,
    pub restaurant_name: Option<String>,
    pub voice_preset: Option<String>,
    pub module: Option<String>,
}

/// Capture and detection tuning
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Acoustic environment ("quiet", "moderate", "noisy", "auto")
    pub environment: Option<Environment>,

    /// Samples per frame (128, 256 or 512)
    pub frame_size: Option<usize>,

    /// Frames buffered between capture and controller
    pub frame_queue_depth: Option<usize>,

    /// Milliseconds of ambient audio used for calibration
    pub calibration_ms: Option<u64>,

    /// Interrupt playback when the user starts talking
    pub auto_barge_in: Option<bool>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the contents are not valid TOML for this schema
pub fn parse_config_file(content: &str) -> Result<ConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the config file from the standard location
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voiceturn/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voiceturn").join("config.toml"))
}
