//! Sample-rate conversion for devices that cannot run at the wire rate

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::{Error, Result};

/// Streaming mono resampler wrapping rubato's `SincFixedIn`
///
/// Buffers residual input between calls since rubato consumes fixed-size
/// chunks.
pub struct StreamResampler {
    inner: SincFixedIn<f32>,
    pending: Vec<f32>,
    from: u32,
    to: u32,
}

impl StreamResampler {
    /// Create a resampler from `from` Hz to `to` Hz
    ///
    /// # Errors
    ///
    /// Returns error if either rate is zero or rubato rejects the ratio
    pub fn new(from: u32, to: u32) -> Result<Self> {
        if from == 0 || to == 0 {
            return Err(Error::Config(format!("invalid resample rates {from} -> {to}")));
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        // ~10ms chunks at input rate
        let chunk_size = (from as usize / 100).max(1);
        let inner = SincFixedIn::new(f64::from(to) / f64::from(from), 1.0, params, chunk_size, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        tracing::debug!(from, to, chunk_size, "resampler created");

        Ok(Self {
            inner,
            pending: Vec::new(),
            from,
            to,
        })
    }

    /// Resample as many full chunks as are available
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match self.inner.process(&[&chunk], None) {
                Ok(result) => {
                    if let Some(channel) = result.first() {
                        output.extend_from_slice(channel);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "resample error");
                    break;
                }
            }
        }
        output
    }

    /// Flush residual input, padding the last chunk with silence
    pub fn finish(&mut self) -> Vec<f32> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let chunk = std::mem::take(&mut self.pending);
        let input = [chunk.as_slice()];
        match self.inner.process_partial(Some(&input[..]), None) {
            Ok(result) => result.into_iter().next().unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "resample flush error");
                Vec::new()
            }
        }
    }

    /// Input sample rate
    #[must_use]
    pub const fn input_rate(&self) -> u32 {
        self.from
    }

    /// Output sample rate
    #[must_use]
    pub const fn output_rate(&self) -> u32 {
        self.to
    }
}

/// Resample a complete buffer in one go
///
/// # Errors
///
/// Returns error if the resampler cannot be created
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(from, to)?;
    let mut out = resampler.process(samples);
    out.extend(resampler.finish());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples);
    }

    #[test]
    fn downsample_length_tracks_ratio() {
        let samples = vec![0.0f32; 48_000];
        let out = resample(&samples, 48_000, 16_000).unwrap();
        // One second in, roughly one second out
        assert!(out.len() >= 15_000 && out.len() <= 17_000, "len {}", out.len());
    }

    #[test]
    fn zero_rate_rejected() {
        assert!(StreamResampler::new(0, 16_000).is_err());
    }
}
