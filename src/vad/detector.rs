//! Adaptive energy-based voice activity detection

use std::time::Duration;

use super::preset::{Environment, VadParams, auto_detect_environment};
use crate::voice::{AudioFrame, FRAME_SIZE, SAMPLE_RATE, SUPPORTED_FRAME_SIZES, frame_duration_ms, rms};
use crate::{Error, Result};

/// Noise floor assumed before calibration
pub const DEFAULT_NOISE_FLOOR: f32 = 0.005;

/// Smoothing factor of the noise floor moving average
const NOISE_FLOOR_ALPHA: f32 = 0.05;

/// Frames quieter than this multiple of the floor update it
const NOISE_FLOOR_UPDATE_RATIO: f32 = 1.5;

/// Frame time without confirmed speech before counters are reset
const WATCHDOG_MS: f32 = 5_000.0;

/// Calibration samples quieter than this are treated as a dead input
const MIN_CALIBRATION_RMS: f32 = 1e-6;

/// Detector construction options
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Environment preset
    pub environment: Environment,
    /// Samples per frame
    pub frame_size: usize,
    /// Input sample rate in Hz
    pub sample_rate: u32,
    /// Explicit parameters overriding the preset
    pub params: Option<VadParams>,
}

impl VadConfig {
    /// Config for `environment` with default framing
    #[must_use]
    pub const fn new(environment: Environment) -> Self {
        Self {
            environment,
            frame_size: FRAME_SIZE,
            sample_rate: SAMPLE_RATE,
            params: None,
        }
    }

    /// Effective parameters
    #[must_use]
    pub fn params(&self) -> VadParams {
        self.params
            .unwrap_or_else(|| VadParams::for_environment(self.environment))
    }

    fn validate(&self) -> Result<()> {
        if !SUPPORTED_FRAME_SIZES.contains(&self.frame_size) {
            return Err(Error::Config(format!(
                "frame size must be one of {SUPPORTED_FRAME_SIZES:?}, got {}",
                self.frame_size
            )));
        }
        if self.sample_rate != SAMPLE_RATE {
            return Err(Error::Config(format!(
                "sample rate must be {SAMPLE_RATE} Hz, got {}",
                self.sample_rate
            )));
        }
        self.params().validate()
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}

/// Per-frame classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadResult {
    /// Confirmed speech, including tolerated pauses inside an utterance
    pub is_speech: bool,
    /// Speech likelihood in [0, 1]
    pub probability: f32,
    /// Frame RMS
    pub rms: f32,
    /// Frame timestamp
    pub timestamp: Duration,
    /// Set on the frame that closes a confirmed utterance
    pub end_of_speech: bool,
}

/// Result of a calibration pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    /// Measured ambient RMS
    pub noise_floor_rms: f32,
    /// Environment in effect after calibration
    pub environment: Environment,
}

/// Classifies frames as speech or silence relative to an adaptive noise floor
///
/// A frame is provisionally speech when its RMS clears
/// `max(rms_base_threshold, noise_floor * noise_floor_multiplier)` by enough
/// margin. Speech is confirmed only after `min_speech_duration_ms` of
/// consecutive provisional frames, and a confirmed utterance survives up to
/// `max_silence_frames` quiet frames.
#[derive(Debug)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    params: VadParams,
    environment: Environment,
    frame_ms: f32,
    min_speech_frames: u32,
    noise_floor: f32,
    baseline_noise_floor: f32,
    speech_frames: u32,
    silence_frames: u32,
    in_speech: bool,
    ms_without_speech: f32,
    calibration: Option<Vec<f32>>,
}

impl VoiceActivityDetector {
    /// Create a detector
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the frame size, sample rate, or
    /// parameters are out of range
    pub fn new(config: VadConfig) -> Result<Self> {
        config.validate()?;

        let params = config.params();
        let frame_ms = frame_duration_ms(config.frame_size, config.sample_rate);
        let environment = config.environment;

        tracing::debug!(
            environment = %environment,
            frame_size = config.frame_size,
            frame_ms,
            "voice activity detector initialized"
        );

        Ok(Self {
            min_speech_frames: min_speech_frames(&params, frame_ms),
            config,
            params,
            environment,
            frame_ms,
            noise_floor: DEFAULT_NOISE_FLOOR,
            baseline_noise_floor: DEFAULT_NOISE_FLOOR,
            speech_frames: 0,
            silence_frames: 0,
            in_speech: false,
            ms_without_speech: 0.0,
            calibration: None,
        })
    }

    /// Classify one frame
    pub fn process(&mut self, frame: &AudioFrame) -> VadResult {
        self.process_samples(frame.samples(), frame.timestamp())
    }

    /// Classify one frame given as raw samples
    pub fn process_samples(&mut self, samples: &[f32], timestamp: Duration) -> VadResult {
        let level = rms(samples);

        if let Some(buffer) = self.calibration.as_mut() {
            buffer.extend_from_slice(samples);
            return VadResult {
                is_speech: false,
                probability: 0.0,
                rms: level,
                timestamp,
                end_of_speech: false,
            };
        }

        if level < self.noise_floor * NOISE_FLOOR_UPDATE_RATIO {
            self.noise_floor += NOISE_FLOOR_ALPHA * (level - self.noise_floor);
        }

        let probability = self.probability(level);
        let provisional = probability >= self.params.vad_threshold;
        let mut end_of_speech = false;

        if provisional {
            self.speech_frames = self.speech_frames.saturating_add(1);
            self.silence_frames = 0;
            if !self.in_speech && self.speech_frames >= self.min_speech_frames {
                self.in_speech = true;
                tracing::debug!(
                    timestamp_ms = timestamp.as_millis(),
                    rms = level,
                    noise_floor = self.noise_floor,
                    "speech confirmed"
                );
            }
        } else if self.in_speech {
            self.silence_frames += 1;
            if self.silence_frames > self.params.max_silence_frames {
                self.in_speech = false;
                self.speech_frames = 0;
                self.silence_frames = 0;
                end_of_speech = true;
                tracing::debug!(timestamp_ms = timestamp.as_millis(), "speech ended");
            }
        } else {
            self.speech_frames = 0;
        }

        if self.in_speech {
            self.ms_without_speech = 0.0;
        } else {
            self.ms_without_speech += self.frame_ms;
            if self.ms_without_speech > WATCHDOG_MS {
                tracing::trace!(
                    noise_floor = self.noise_floor,
                    baseline = self.baseline_noise_floor,
                    "vad watchdog reset"
                );
                self.reset();
                self.noise_floor = self.baseline_noise_floor;
            }
        }

        tracing::trace!(
            rms = level,
            probability,
            provisional,
            is_speech = self.in_speech,
            "vad frame"
        );

        VadResult {
            is_speech: self.in_speech,
            probability,
            rms: level,
            timestamp,
            end_of_speech,
        }
    }

    /// Speech probability for an RMS level at the current threshold
    #[must_use]
    pub fn probability(&self, level: f32) -> f32 {
        ((level / self.threshold() - 0.5) / 1.5).clamp(0.0, 1.0)
    }

    /// Effective RMS threshold
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.params
            .rms_base_threshold
            .max(self.noise_floor * self.params.noise_floor_multiplier)
    }

    /// Set the noise floor from a buffer of known silence
    ///
    /// Under [`Environment::Auto`] this also applies the detected preset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Calibration`] if the buffer is empty, non-finite, or
    /// carries no signal at all
    pub fn calibrate(&mut self, samples: &[f32]) -> Result<CalibrationProfile> {
        if samples.is_empty() {
            return Err(Error::Calibration("no samples captured".to_string()));
        }
        let level = rms(samples);
        if !level.is_finite() {
            return Err(Error::Calibration("calibration sample is not finite".to_string()));
        }
        if level < MIN_CALIBRATION_RMS {
            return Err(Error::Calibration(
                "calibration sample is silent, input may be muted".to_string(),
            ));
        }

        self.noise_floor = level;
        self.baseline_noise_floor = level;

        if self.config.environment == Environment::Auto {
            let detected = auto_detect_environment(level);
            self.environment = detected;
            if self.config.params.is_none() {
                self.apply_params(VadParams::for_environment(detected));
            }
        }
        self.reset();

        let profile = self.profile();
        tracing::info!(
            noise_floor = profile.noise_floor_rms,
            environment = %profile.environment,
            "vad calibrated"
        );
        Ok(profile)
    }

    /// Start buffering frames for calibration instead of classifying them
    pub fn begin_calibration(&mut self) {
        self.calibration = Some(Vec::new());
        tracing::debug!("vad calibration started");
    }

    /// Finish a calibration started with [`Self::begin_calibration`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::Calibration`] if no calibration is running or the
    /// buffered audio is unusable
    pub fn finish_calibration(&mut self) -> Result<CalibrationProfile> {
        let samples = self
            .calibration
            .take()
            .ok_or_else(|| Error::Calibration("calibration not started".to_string()))?;
        self.calibrate(&samples)
    }

    /// Whether frames are currently being buffered for calibration
    #[must_use]
    pub const fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    /// Drop calibration and go back to the configured preset and default floor
    pub fn use_defaults(&mut self) {
        self.calibration = None;
        self.environment = self.config.environment;
        self.apply_params(self.config.params());
        self.noise_floor = DEFAULT_NOISE_FLOOR;
        self.baseline_noise_floor = DEFAULT_NOISE_FLOOR;
        self.reset();
        tracing::debug!(environment = %self.environment, "vad using default thresholds");
    }

    /// Reset hysteresis counters, keeping the noise floor
    pub fn reset(&mut self) {
        self.speech_frames = 0;
        self.silence_frames = 0;
        self.in_speech = false;
        self.ms_without_speech = 0.0;
    }

    /// Current calibration state
    #[must_use]
    pub const fn profile(&self) -> CalibrationProfile {
        CalibrationProfile {
            noise_floor_rms: self.noise_floor,
            environment: self.environment,
        }
    }

    /// Current noise floor estimate
    #[must_use]
    pub const fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Parameters in effect
    #[must_use]
    pub const fn params(&self) -> &VadParams {
        &self.params
    }

    /// Environment in effect
    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }

    /// Duration of one frame in milliseconds
    #[must_use]
    pub const fn frame_ms(&self) -> f32 {
        self.frame_ms
    }

    /// Consecutive provisional frames needed to confirm speech
    #[must_use]
    pub const fn min_speech_frames(&self) -> u32 {
        self.min_speech_frames
    }

    /// Whether a confirmed utterance is open
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        self.in_speech
    }

    fn apply_params(&mut self, params: VadParams) {
        self.params = params;
        self.min_speech_frames = min_speech_frames(&params, self.frame_ms);
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn min_speech_frames(params: &VadParams, frame_ms: f32) -> u32 {
    let frames = (params.min_speech_duration_ms as f32 / frame_ms).ceil();
    (frames as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(environment: Environment) -> VoiceActivityDetector {
        VoiceActivityDetector::new(VadConfig::new(environment)).unwrap()
    }

    fn frame(amplitude: f32) -> Vec<f32> {
        vec![amplitude; FRAME_SIZE]
    }

    #[test]
    fn min_speech_frames_rounds_up() {
        // 300 / 32 = 9.375
        assert_eq!(detector(Environment::Moderate).min_speech_frames(), 10);
        // 200 / 32 = 6.25
        assert_eq!(detector(Environment::Quiet).min_speech_frames(), 7);
    }

    #[test]
    fn rejects_unsupported_frame_size() {
        let mut config = VadConfig::new(Environment::Moderate);
        config.frame_size = 480;
        assert!(matches!(VoiceActivityDetector::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_wrong_sample_rate() {
        let mut config = VadConfig::new(Environment::Moderate);
        config.sample_rate = 48_000;
        assert!(VoiceActivityDetector::new(config).is_err());
    }

    #[test]
    fn rejects_invalid_override() {
        let mut config = VadConfig::new(Environment::Moderate);
        let mut params = VadParams::default();
        params.vad_threshold = -0.1;
        config.params = Some(params);
        assert!(VoiceActivityDetector::new(config).is_err());
    }

    #[test]
    fn probability_formula() {
        let vad = detector(Environment::Moderate);
        let threshold = vad.threshold();
        assert!((threshold - 0.015).abs() < 1e-6);
        assert!(vad.probability(0.0).abs() < f32::EPSILON);
        assert!((vad.probability(threshold) - 1.0 / 3.0).abs() < 1e-5);
        assert!((vad.probability(threshold * 10.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn noise_floor_only_follows_quiet_frames() {
        let mut vad = detector(Environment::Moderate);
        vad.process_samples(&frame(0.5), Duration::ZERO);
        assert!((vad.noise_floor() - DEFAULT_NOISE_FLOOR).abs() < f32::EPSILON);

        vad.process_samples(&frame(0.001), Duration::ZERO);
        let expected = DEFAULT_NOISE_FLOOR + NOISE_FLOOR_ALPHA * (0.001 - DEFAULT_NOISE_FLOOR);
        assert!((vad.noise_floor() - expected).abs() < 1e-7);
    }

    #[test]
    fn silence_before_confirmation_resets_count() {
        let mut vad = detector(Environment::Moderate);
        let mut ts = Duration::ZERO;
        for _ in 0..9 {
            assert!(!vad.process_samples(&frame(0.3), ts).is_speech);
            ts += Duration::from_millis(32);
        }
        assert!(!vad.process_samples(&frame(0.0), ts).is_speech);
        for _ in 0..9 {
            assert!(!vad.process_samples(&frame(0.3), ts).is_speech);
        }
        assert!(vad.process_samples(&frame(0.3), ts).is_speech);
    }

    #[test]
    fn utterance_closes_after_max_silence_frames() {
        let mut vad = detector(Environment::Moderate);
        for _ in 0..10 {
            vad.process_samples(&frame(0.3), Duration::ZERO);
        }
        assert!(vad.in_speech());

        for _ in 0..25 {
            let result = vad.process_samples(&frame(0.0), Duration::ZERO);
            assert!(result.is_speech);
            assert!(!result.end_of_speech);
        }
        let closing = vad.process_samples(&frame(0.0), Duration::ZERO);
        assert!(!closing.is_speech);
        assert!(closing.end_of_speech);
    }

    #[test]
    fn watchdog_restores_baseline_floor() {
        let mut vad = detector(Environment::Moderate);
        // Just under the update ratio so the floor creeps up
        for _ in 0..100 {
            let level = vad.noise_floor() * 1.4;
            vad.process_samples(&frame(level), Duration::ZERO);
        }
        assert!(vad.noise_floor() > DEFAULT_NOISE_FLOOR * 2.0);

        // 5s of 32ms frames is 156.25 frames
        for _ in 0..60 {
            let level = vad.noise_floor() * 1.4;
            vad.process_samples(&frame(level), Duration::ZERO);
        }
        assert!(vad.noise_floor() < DEFAULT_NOISE_FLOOR * 1.5);
    }

    #[test]
    fn calibrate_sets_floor_and_auto_preset() {
        let mut vad = detector(Environment::Auto);
        let profile = vad.calibrate(&frame(0.004)).unwrap();

        assert!((profile.noise_floor_rms - 0.004).abs() < 1e-6);
        assert_eq!(profile.environment, Environment::Quiet);
        assert_eq!(*vad.params(), VadParams::for_environment(Environment::Quiet));
        assert_eq!(vad.min_speech_frames(), 7);
    }

    #[test]
    fn calibrate_keeps_fixed_environment() {
        let mut vad = detector(Environment::Noisy);
        let profile = vad.calibrate(&frame(0.004)).unwrap();
        assert_eq!(profile.environment, Environment::Noisy);
        assert_eq!(*vad.params(), VadParams::for_environment(Environment::Noisy));
    }

    #[test]
    fn calibrate_rejects_dead_input() {
        let mut vad = detector(Environment::Auto);
        assert!(matches!(vad.calibrate(&[]), Err(Error::Calibration(_))));
        assert!(matches!(vad.calibrate(&frame(0.0)), Err(Error::Calibration(_))));
        assert!(matches!(vad.calibrate(&[f32::NAN; 16]), Err(Error::Calibration(_))));
        assert!((vad.noise_floor() - DEFAULT_NOISE_FLOOR).abs() < f32::EPSILON);
    }

    #[test]
    fn calibration_window_buffers_frames() {
        let mut vad = detector(Environment::Auto);
        vad.begin_calibration();
        assert!(vad.is_calibrating());

        for _ in 0..4 {
            let result = vad.process_samples(&frame(0.02), Duration::ZERO);
            assert!(!result.is_speech);
        }
        let profile = vad.finish_calibration().unwrap();

        assert!(!vad.is_calibrating());
        assert_eq!(profile.environment, Environment::Noisy);
        assert!(vad.finish_calibration().is_err());
    }

    #[test]
    fn use_defaults_restores_configured_preset() {
        let mut vad = detector(Environment::Auto);
        vad.calibrate(&frame(0.004)).unwrap();
        vad.use_defaults();

        assert_eq!(vad.environment(), Environment::Auto);
        assert_eq!(*vad.params(), VadParams::for_environment(Environment::Moderate));
        assert!((vad.noise_floor() - DEFAULT_NOISE_FLOOR).abs() < f32::EPSILON);
    }
}
