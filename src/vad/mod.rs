//! Voice activity detection
//!
//! Energy-based classification against an adaptive noise floor, tuned by
//! per-environment presets and an optional calibration pass.

mod detector;
mod preset;

pub use detector::{
    CalibrationProfile, DEFAULT_NOISE_FLOOR, VadConfig, VadResult, VoiceActivityDetector,
};
pub use preset::{
    Environment, MODERATE_RMS_CEILING, QUIET_RMS_CEILING, VadParams, auto_detect_environment,
};
