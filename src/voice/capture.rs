//! Audio capture from microphone
//!
//! The capture path never blocks on the consumer: frames go into a bounded
//! [`FrameQueue`] that drops the oldest frame when the consumer falls behind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use tokio::sync::Notify;

use super::frame::{AudioFrame, FRAME_SIZE, FrameAssembler, SAMPLE_RATE};
use super::resample::StreamResampler;
use crate::{Error, Result};

/// Callback receiving each completed frame
///
/// Runs on the capture thread and must not block.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// A source of fixed-size PCM frames
///
/// Decouples the turn controller from any particular capture API.
pub trait FrameSource: Send {
    /// Acquire the input device
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if no usable input exists
    fn initialize(&mut self) -> Result<()>;

    /// Start delivering frames to `on_frame`
    ///
    /// Starting an already running source is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened
    fn start_capture(&mut self, on_frame: FrameCallback) -> Result<()>;

    /// Stop delivering frames and release the device; safe to call repeatedly
    fn stop_capture(&mut self);

    /// Check if currently capturing
    fn is_capturing(&self) -> bool;
}

/// Bounded frame queue between the capture thread and the controller
///
/// When full, pushing evicts the oldest frame; the queue never grows past
/// its capacity and never blocks the producer.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a frame, evicting the oldest one if the queue is full
    ///
    /// Returns `false` when a frame was evicted.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let evicted = {
            let Ok(mut frames) = self.frames.lock() else {
                return false;
            };
            let evicted = if frames.len() >= self.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(frame);
            evicted
        };

        if evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total.is_multiple_of(50) {
                tracing::debug!(dropped = total, "frame queue full, dropping oldest frames");
            }
        }
        self.notify.notify_one();
        !evicted
    }

    /// Pop the oldest frame without waiting
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames.lock().ok()?.pop_front()
    }

    /// Wait for the next frame
    ///
    /// Cancel safe: a frame is only removed in the poll that returns it.
    pub async fn pop(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Discard all queued frames
    pub fn clear(&self) {
        if let Ok(mut frames) = self.frames.lock() {
            frames.clear();
        }
    }

    /// Number of queued frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or_default()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued frames
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted because the consumer fell behind
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Negotiated input format
#[derive(Debug, Clone)]
struct InputFormat {
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl InputFormat {
    const fn channels(&self) -> usize {
        self.config.channels as usize
    }

    const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

/// Running capture thread
struct CaptureWorker {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Captures audio from the default input device
///
/// The cpal stream lives on a dedicated thread, so the handle itself is
/// `Send` and can be owned by an async task.
pub struct CpalCapture {
    frame_size: usize,
    format: Option<InputFormat>,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    /// Create a capture source producing frames of `frame_size` samples
    #[must_use]
    pub const fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            format: None,
            worker: None,
        }
    }

    /// Frame size in samples
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn negotiate() -> Result<InputFormat> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)));

        // Fallback: device default format, downmixed and resampled
        let supported = match supported {
            Some(c) => c,
            None => device
                .default_input_config()
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?,
        };

        let format = InputFormat {
            sample_format: supported.sample_format(),
            config: supported.config(),
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = format.sample_rate(),
            channels = format.channels(),
            sample_format = ?format.sample_format,
            "audio capture initialized"
        );

        Ok(format)
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new(FRAME_SIZE)
    }
}

impl FrameSource for CpalCapture {
    fn initialize(&mut self) -> Result<()> {
        if self.format.is_none() {
            self.format = Some(Self::negotiate()?);
        }
        Ok(())
    }

    fn start_capture(&mut self, on_frame: FrameCallback) -> Result<()> {
        if self.worker.is_some() {
            tracing::debug!("capture already running");
            return Ok(());
        }

        let format = match &self.format {
            Some(f) => f.clone(),
            None => {
                self.initialize()?;
                self.format
                    .clone()
                    .ok_or_else(|| Error::DeviceUnavailable("input not negotiated".to_string()))?
            }
        };

        let frame_size = self.frame_size;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name("voiceturn-capture".to_string())
            .spawn(move || run_capture_thread(&format, frame_size, on_frame, &ready_tx, &stop_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("capture thread exited during startup".to_string()))
            }
        }
    }

    fn stop_capture(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

/// Converts raw device callbacks into mono 16kHz frames
struct CallbackPipeline {
    channels: usize,
    resampler: Option<StreamResampler>,
    assembler: FrameAssembler,
    on_frame: FrameCallback,
    mono: Vec<f32>,
}

impl CallbackPipeline {
    fn push(&mut self, data: &[f32]) {
        self.mono.clear();
        if self.channels > 1 {
            #[allow(clippy::cast_precision_loss)]
            let scale = 1.0 / self.channels as f32;
            self.mono.extend(
                data.chunks(self.channels)
                    .map(|frame| frame.iter().sum::<f32>() * scale),
            );
        } else {
            self.mono.extend_from_slice(data);
        }

        let on_frame = &mut self.on_frame;
        match self.resampler.as_mut() {
            Some(resampler) => {
                let resampled = resampler.process(&self.mono);
                self.assembler.push(&resampled, |f| on_frame(f));
            }
            None => self.assembler.push(&self.mono, |f| on_frame(f)),
        }
    }
}

fn run_capture_thread(
    format: &InputFormat,
    frame_size: usize,
    on_frame: FrameCallback,
    ready_tx: &mpsc::Sender<Result<()>>,
    stop_rx: &mpsc::Receiver<()>,
) {
    let stream = match open_stream(format, frame_size, on_frame) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Park until stopped or the owner is gone
    let _ = stop_rx.recv();
    drop(stream);
}

fn open_stream(format: &InputFormat, frame_size: usize, on_frame: FrameCallback) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device".to_string()))?;

    let resampler = if format.sample_rate() == SAMPLE_RATE {
        None
    } else {
        Some(StreamResampler::new(format.sample_rate(), SAMPLE_RATE)?)
    };

    let mut pipeline = CallbackPipeline {
        channels: format.channels().max(1),
        resampler,
        assembler: FrameAssembler::new(frame_size, SAMPLE_RATE),
        on_frame,
        mono: Vec::new(),
    };

    let err_fn = |err| tracing::error!(error = %err, "audio capture error");
    let config = &format.config;

    let stream = match format.sample_format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| pipeline.push(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| f32::from(s) / 32768.0));
                    pipeline.push(&scratch);
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let mut scratch = Vec::new();
            device.build_input_stream(
                config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| (f32::from(s) - 32768.0) / 32768.0));
                    pipeline.push(&scratch);
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(Error::DeviceUnavailable(format!(
                "unsupported sample format: {other:?}"
            )));
        }
    };

    stream.map_err(|e| Error::Audio(e.to_string()))
}

/// List available input devices by name
///
/// # Errors
///
/// Returns error if the audio host cannot enumerate devices
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(devices.filter_map(|d| d.name().ok()).collect())
}
