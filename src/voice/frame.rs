//! Fixed-size capture frames

use std::sync::Arc;
use std::time::Duration;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16_000;

/// Default frame size in samples (~32ms at 16kHz)
pub const FRAME_SIZE: usize = 512;

/// Frame sizes the VAD accepts
pub const SUPPORTED_FRAME_SIZES: [usize; 3] = [128, 256, 512];

/// A fixed-length block of normalized mono samples
///
/// Frames are immutable once produced; cloning shares the sample buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
    timestamp: Duration,
}

impl AudioFrame {
    /// Create a frame from samples in [-1, 1]
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp,
        }
    }

    /// Frame samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Number of samples in the frame
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Offset of the first sample since capture started
    #[must_use]
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Duration covered by this frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len() as u64, self.sample_rate)
    }

    /// Root-mean-square amplitude of the frame
    #[must_use]
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Duration of one frame of `frame_size` samples, in milliseconds
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn frame_duration_ms(frame_size: usize, sample_rate: u32) -> f32 {
    frame_size as f32 * 1000.0 / sample_rate as f32
}

fn samples_to_duration(samples: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate))
}

/// Cuts a continuous sample stream into fixed-size frames
///
/// Timestamps are derived from the number of samples emitted so far, so they
/// stay monotonic regardless of callback jitter.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    emitted: u64,
}

impl FrameAssembler {
    /// Create an assembler producing frames of `frame_size` samples
    #[must_use]
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size),
            emitted: 0,
        }
    }

    /// Append samples and emit every completed frame
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        let mut rest = samples;
        while !rest.is_empty() {
            let needed = self.frame_size - self.pending.len();
            let take = needed.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let timestamp = samples_to_duration(self.emitted, self.sample_rate);
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                self.emitted += self.frame_size as u64;
                emit(AudioFrame::new(samples, self.sample_rate, timestamp));
            }
        }
    }

    /// Samples waiting for the next frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop partial data and restart timestamps at zero
    pub fn reset(&mut self) {
        self.pending.clear();
        self.emitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert!(rms(&[0.0; 100]) < 0.001);
        assert!((rms(&[0.5; 100]) - 0.5).abs() < 1e-6);
        assert!(rms(&[]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_frame_duration() {
        assert!((frame_duration_ms(512, SAMPLE_RATE) - 32.0).abs() < 1e-4);
        assert!((frame_duration_ms(256, SAMPLE_RATE) - 16.0).abs() < 1e-4);
    }

    #[test]
    fn assembler_emits_full_frames_only() {
        let mut assembler = FrameAssembler::new(512, SAMPLE_RATE);
        let mut frames = Vec::new();

        assembler.push(&[0.1; 1000], |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert_eq!(assembler.pending(), 488);

        assembler.push(&[0.1; 24], |f| frames.push(f));
        assert_eq!(frames.len(), 2);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn assembler_timestamps_follow_sample_count() {
        let mut assembler = FrameAssembler::new(512, SAMPLE_RATE);
        let mut frames = Vec::new();

        assembler.push(&[0.0; 512 * 3], |f| frames.push(f));

        assert_eq!(frames[0].timestamp(), Duration::ZERO);
        assert_eq!(frames[1].timestamp(), Duration::from_millis(32));
        assert_eq!(frames[2].timestamp(), Duration::from_millis(64));
        assert_eq!(frames[2].duration(), Duration::from_millis(32));
    }
}
