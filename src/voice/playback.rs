//! Audio playback to speakers
//!
//! [`PlaybackBuffer`] queues decoded chunks and plays them strictly in order
//! through an [`AudioSink`]. Flushing drops everything queued and halts the
//! chunk that is currently audible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::resample;
use crate::{Error, Result};

/// Default sample rate of assistant audio
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// A decoded block of assistant audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Mono samples in [-1, 1]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Create a chunk
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback duration of the chunk
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// Something that can render a chunk audibly
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play one chunk to completion
    ///
    /// Must return promptly once `halt` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns error if the output device fails
    async fn play(&self, chunk: &AudioChunk, halt: CancellationToken) -> Result<()>;
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<AudioChunk>,
    current: Option<CancellationToken>,
    closed: bool,
}

impl Queue {
    fn len(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Notify,
    drained: Notify,
    sink: Arc<dyn AudioSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Ordered playback queue with immediate flush
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct PlaybackBuffer {
    shared: Arc<Shared>,
}

impl PlaybackBuffer {
    /// Create a buffer and spawn its playback worker
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            drained: Notify::new(),
            sink,
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(run_worker(Arc::clone(&shared)));
        if let Ok(mut worker) = shared.worker.lock() {
            *worker = Some(handle);
        }

        Self { shared }
    }

    /// Append a chunk to the tail of the queue
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] once the buffer is closed
    pub fn enqueue(&self, chunk: AudioChunk) -> Result<()> {
        if chunk.samples.is_empty() {
            return Ok(());
        }

        {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(Error::SessionClosed);
            }
            queue.pending.push_back(chunk);
            tracing::trace!(queued = queue.len(), "playback chunk enqueued");
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Drop all queued chunks and halt the one playing
    ///
    /// Returns the number of chunks discarded. A chunk enqueued after this
    /// returns is never affected.
    pub fn flush(&self) -> usize {
        let dropped = {
            let mut queue = self.shared.lock();
            let dropped = queue.len();
            queue.pending.clear();
            if let Some(halt) = queue.current.take() {
                halt.cancel();
            }
            dropped
        };

        if dropped > 0 {
            tracing::debug!(dropped, "playback flushed");
        }
        self.shared.drained.notify_waiters();
        dropped
    }

    /// Chunks queued plus the one playing
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    /// Whether nothing is queued or playing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a chunk is currently being played
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    /// Wait until everything queued has finished playing
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }

    /// Flush, stop the worker, and reject further chunks
    pub async fn close(&self) {
        {
            let mut queue = self.shared.lock();
            queue.closed = true;
            queue.pending.clear();
            if let Some(halt) = queue.current.take() {
                halt.cancel();
            }
        }
        self.shared.wake.notify_one();
        self.shared.drained.notify_waiters();

        let handle = self.shared.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "playback worker ended abnormally");
        }
    }
}

impl std::fmt::Debug for PlaybackBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackBuffer")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.lock();
            if queue.closed {
                break;
            }
            queue.pending.pop_front().map(|chunk| {
                let halt = CancellationToken::new();
                queue.current = Some(halt.clone());
                (chunk, halt)
            })
        };

        let Some((chunk, halt)) = next else {
            shared.wake.notified().await;
            continue;
        };

        if let Err(e) = shared.sink.play(&chunk, halt.clone()).await {
            tracing::warn!(error = %e, "failed to play chunk");
        }

        let idle = {
            let mut queue = shared.lock();
            // Only this worker fills the slot; a flush may have emptied it already
            queue.current = None;
            queue.len() == 0
        };
        if idle {
            shared.drained.notify_waiters();
        }
    }
    tracing::debug!("playback worker stopped");
}

/// Plays chunks on the default output device
///
/// Each chunk runs on a blocking thread; the device is reopened per chunk,
/// resampling when it cannot run at the chunk's rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalSink;

impl CpalSink {
    /// Create a sink, verifying an output device exists
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if there is no output device
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );
        Ok(Self)
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, chunk: &AudioChunk, halt: CancellationToken) -> Result<()> {
        let chunk = chunk.clone();
        tokio::task::spawn_blocking(move || play_blocking(&chunk, &halt))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let exact = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .find(|c| {
            c.channels() <= 2
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .map(|c| c.with_sample_rate(SampleRate(sample_rate)).config());

    match exact {
        Some(config) => Ok(config),
        None => device
            .default_output_config()
            .map(|c| c.config())
            .map_err(|e| Error::Audio(e.to_string())),
    }
}

fn play_blocking(chunk: &AudioChunk, halt: &CancellationToken) -> Result<()> {
    if chunk.samples.is_empty() || halt.is_cancelled() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device".to_string()))?;

    let config = output_config(&device, chunk.sample_rate)?;
    let channels = usize::from(config.channels.max(1));
    let device_rate = config.sample_rate.0;

    let samples = if device_rate == chunk.sample_rate {
        chunk.samples.clone()
    } else {
        resample::resample(&chunk.samples, chunk.sample_rate, device_rate)?
    };
    let sample_count = samples.len();

    let finished = Arc::new(AtomicBool::new(false));
    let finished_cb = Arc::clone(&finished);
    let halt_cb = halt.clone();
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let halted = halt_cb.is_cancelled();
                for frame in data.chunks_mut(channels) {
                    let sample = if halted {
                        0.0
                    } else {
                        samples.get(position).copied().unwrap_or(0.0)
                    };
                    frame.fill(sample);
                    position += 1;
                }
                if halted || position >= samples.len() {
                    finished_cb.store(true, Ordering::Release);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(device_rate.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = std::time::Instant::now();

    while !finished.load(Ordering::Acquire) && !halt.is_cancelled() {
        if start.elapsed() > timeout {
            tracing::warn!("playback timed out");
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    drop(stream);
    tracing::trace!(
        samples = sample_count,
        halted = halt.is_cancelled(),
        "chunk playback complete"
    );
    Ok(())
}
