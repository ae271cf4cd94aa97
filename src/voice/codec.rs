//! PCM16 and base64 conversion for transport

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Convert f32 samples to little-endian signed 16-bit PCM
///
/// Samples are clamped to [-1.0, 1.0]; NaN encodes as silence. Negative
/// values scale by 32768 and positive by 32767 so both ends of the range
/// are reachable.
#[must_use]
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    out
}

#[allow(clippy::cast_possible_truncation)]
fn sample_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round().clamp(-32768.0, 32767.0) as i16
}

/// Convert little-endian signed 16-bit PCM back to f32 samples
///
/// # Errors
///
/// Returns a protocol error if the byte count is odd
pub fn pcm16_to_float(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "pcm16 payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            if value < 0 {
                f32::from(value) / 32768.0
            } else {
                f32::from(value) / 32767.0
            }
        })
        .collect())
}

/// Base64-encode a byte buffer (standard alphabet, padded)
#[must_use]
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 payload
///
/// # Errors
///
/// Returns a protocol error if the payload is not valid base64
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::Protocol(format!("invalid base64 audio: {e}")))
}

/// Encode f32 samples straight to the base64 wire form
#[must_use]
pub fn encode_samples(samples: &[f32]) -> String {
    encode_base64(&float_to_pcm16(samples))
}

/// Convert f32 samples to an in-memory mono 16-bit WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
