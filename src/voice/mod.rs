//! Audio plumbing
//!
//! Handles microphone capture, frame assembly, PCM16 conversion, resampling,
//! and ordered playback of assistant audio.

mod capture;
pub mod codec;
mod frame;
mod playback;
pub mod resample;

pub use capture::{CpalCapture, FrameCallback, FrameQueue, FrameSource, list_input_devices};
pub use codec::samples_to_wav;
pub use frame::{
    AudioFrame, FRAME_SIZE, FrameAssembler, SAMPLE_RATE, SUPPORTED_FRAME_SIZES,
    frame_duration_ms, rms,
};
pub use playback::{AudioChunk, AudioSink, CpalSink, PLAYBACK_SAMPLE_RATE, PlaybackBuffer};
