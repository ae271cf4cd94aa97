//! Acoustic environment presets

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Ambient RMS below which a room counts as quiet
pub const QUIET_RMS_CEILING: f32 = 0.008;

/// Ambient RMS below which a room counts as moderate
pub const MODERATE_RMS_CEILING: f32 = 0.015;

/// Acoustic environment the detector is tuned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Office or back room
    Quiet,
    /// Dining room during service
    Moderate,
    /// Kitchen line or bar
    Noisy,
    /// Pick a preset from the calibration sample
    #[default]
    Auto,
}

impl Environment {
    /// All environments, in table order
    pub const ALL: [Self; 4] = [Self::Quiet, Self::Moderate, Self::Noisy, Self::Auto];

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quiet => "quiet",
            Self::Moderate => "moderate",
            Self::Noisy => "noisy",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quiet" => Ok(Self::Quiet),
            "moderate" => Ok(Self::Moderate),
            "noisy" => Ok(Self::Noisy),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Config(format!("unknown environment: {other}"))),
        }
    }
}

/// Tuning knobs for one environment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VadParams {
    /// Probability at or above which a frame is provisionally speech
    pub vad_threshold: f32,
    /// Lowest RMS threshold regardless of noise floor
    pub rms_base_threshold: f32,
    /// Threshold as a multiple of the noise floor
    pub noise_floor_multiplier: f32,
    /// Sustained speech needed before confirming an utterance
    pub min_speech_duration_ms: u32,
    /// Trailing silence after which the turn ends
    pub silence_duration_ms: u32,
    /// Silent frames tolerated inside a confirmed utterance
    pub max_silence_frames: u32,
    /// Frames before confirmation sent as pre-roll
    pub positive_speech_pad_frames: u32,
}

impl VadParams {
    /// Preset for `environment`; `Auto` resolves to `Moderate`
    #[must_use]
    pub const fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Quiet => Self {
                vad_threshold: 0.45,
                rms_base_threshold: 0.010,
                noise_floor_multiplier: 2.0,
                min_speech_duration_ms: 200,
                silence_duration_ms: 700,
                max_silence_frames: 20,
                positive_speech_pad_frames: 3,
            },
            Environment::Moderate | Environment::Auto => Self {
                vad_threshold: 0.55,
                rms_base_threshold: 0.015,
                noise_floor_multiplier: 2.5,
                min_speech_duration_ms: 300,
                silence_duration_ms: 800,
                max_silence_frames: 25,
                positive_speech_pad_frames: 4,
            },
            Environment::Noisy => Self {
                vad_threshold: 0.65,
                rms_base_threshold: 0.025,
                noise_floor_multiplier: 3.0,
                min_speech_duration_ms: 400,
                silence_duration_ms: 1000,
                max_silence_frames: 30,
                positive_speech_pad_frames: 5,
            },
        }
    }

    /// Reject out-of-range values
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        if !self.vad_threshold.is_finite() || !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(Error::Config(format!(
                "vad_threshold must be within [0, 1], got {}",
                self.vad_threshold
            )));
        }
        if !self.rms_base_threshold.is_finite() || self.rms_base_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "rms_base_threshold must be positive, got {}",
                self.rms_base_threshold
            )));
        }
        if !self.noise_floor_multiplier.is_finite() || self.noise_floor_multiplier <= 0.0 {
            return Err(Error::Config(format!(
                "noise_floor_multiplier must be positive, got {}",
                self.noise_floor_multiplier
            )));
        }
        Ok(())
    }
}

impl Default for VadParams {
    fn default() -> Self {
        Self::for_environment(Environment::Auto)
    }
}

/// Classify an ambient RMS level into an environment
#[must_use]
pub fn auto_detect_environment(rms: f32) -> Environment {
    if rms < QUIET_RMS_CEILING {
        Environment::Quiet
    } else if rms < MODERATE_RMS_CEILING {
        Environment::Moderate
    } else {
        Environment::Noisy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_detect_boundaries() {
        assert_eq!(auto_detect_environment(0.004), Environment::Quiet);
        assert_eq!(auto_detect_environment(0.008), Environment::Moderate);
        assert_eq!(auto_detect_environment(0.0149), Environment::Moderate);
        assert_eq!(auto_detect_environment(0.015), Environment::Noisy);
    }

    #[test]
    fn auto_uses_moderate_table() {
        assert_eq!(
            VadParams::for_environment(Environment::Auto),
            VadParams::for_environment(Environment::Moderate)
        );
    }

    #[test]
    fn presets_are_valid_and_ordered() {
        let quiet = VadParams::for_environment(Environment::Quiet);
        let noisy = VadParams::for_environment(Environment::Noisy);
        for env in Environment::ALL {
            VadParams::for_environment(env).validate().unwrap();
        }
        assert!(quiet.rms_base_threshold < noisy.rms_base_threshold);
        assert!(quiet.min_speech_duration_ms < noisy.min_speech_duration_ms);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut params = VadParams::default();
        params.vad_threshold = 1.5;
        assert!(params.validate().is_err());

        let mut params = VadParams::default();
        params.noise_floor_multiplier = f32::NAN;
        assert!(params.validate().is_err());

        let mut params = VadParams::default();
        params.rms_base_threshold = 0.0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("Noisy".parse::<Environment>().unwrap(), Environment::Noisy);
        assert!("loud".parse::<Environment>().is_err());
        assert_eq!(Environment::Quiet.to_string(), "quiet");
    }
}
