//! Shared test utilities
//!
//! Stand-ins for the microphone, the voice service, and the speaker so the
//! turn controller can be driven without audio hardware or a network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voiceturn::voice::{FRAME_SIZE, FrameCallback, SAMPLE_RATE};
use voiceturn::{
    AudioChunk, AudioFrame, AudioSink, ClientMessage, Error, FrameSource, InitParams, Result,
    StreamMessage, Transport,
};

/// Upper bound for anything a test waits on
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Frame whose samples alternate between `+level` and `-level`, so its RMS
/// is exactly `level`
#[must_use]
pub fn square_frame(level: f32, timestamp: Duration) -> AudioFrame {
    let samples = (0..FRAME_SIZE)
        .map(|i| if i % 2 == 0 { level } else { -level })
        .collect();
    AudioFrame::new(samples, SAMPLE_RATE, timestamp)
}

/// Generate sine wave audio samples
#[must_use]
pub fn sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SourceState {
    callback: Mutex<Option<FrameCallback>>,
    capturing: AtomicBool,
    fail_initialize: AtomicBool,
    clock: Mutex<Duration>,
}

/// Frame source fed by the test instead of a microphone
pub struct ScriptedSource {
    state: Arc<SourceState>,
}

/// Test side of a [`ScriptedSource`]
#[derive(Clone)]
pub struct SourceHandle {
    state: Arc<SourceState>,
}

#[must_use]
pub fn scripted_source() -> (ScriptedSource, SourceHandle) {
    let state = Arc::new(SourceState::default());
    (
        ScriptedSource {
            state: Arc::clone(&state),
        },
        SourceHandle { state },
    )
}

impl FrameSource for ScriptedSource {
    fn initialize(&mut self) -> Result<()> {
        if self.state.fail_initialize.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("no microphone".to_string()));
        }
        Ok(())
    }

    fn start_capture(&mut self, on_frame: FrameCallback) -> Result<()> {
        *self.state.callback.lock().unwrap() = Some(on_frame);
        self.state.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_capture(&mut self) {
        self.state.capturing.store(false, Ordering::SeqCst);
        self.state.callback.lock().unwrap().take();
    }

    fn is_capturing(&self) -> bool {
        self.state.capturing.load(Ordering::SeqCst)
    }
}

impl SourceHandle {
    pub fn fail_initialize(&self, fail: bool) {
        self.state.fail_initialize.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.state.capturing.load(Ordering::SeqCst)
    }

    /// Deliver `count` frames at RMS `level`; returns how many were delivered
    pub fn push(&self, level: f32, count: usize) -> usize {
        let frame_len = Duration::from_micros(
            FRAME_SIZE as u64 * 1_000_000 / u64::from(SAMPLE_RATE),
        );
        let mut guard = self.state.callback.lock().unwrap();
        let Some(callback) = guard.as_mut() else {
            return 0;
        };
        let mut clock = self.state.clock.lock().unwrap();
        for _ in 0..count {
            *clock += frame_len;
            callback(square_frame(level, *clock));
        }
        count
    }

    /// Loud enough to clear every preset threshold
    pub fn push_speech(&self, count: usize) -> usize {
        self.push(0.3, count)
    }

    pub fn push_silence(&self, count: usize) -> usize {
        self.push(0.0, count)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    sent: Mutex<Vec<ClientMessage>>,
    inbound: Mutex<Option<mpsc::Sender<StreamMessage>>>,
    init: Mutex<Option<InitParams>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
}

/// In-memory transport that records what the controller sends
pub struct MemoryTransport {
    state: Arc<ServerState>,
}

/// Test side of a [`MemoryTransport`]
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

#[must_use]
pub fn memory_transport() -> (MemoryTransport, ServerHandle) {
    let state = Arc::new(ServerState::default());
    (
        MemoryTransport {
            state: Arc::clone(&state),
        },
        ServerHandle { state },
    )
}

impl MemoryTransport {
    fn record(&self, message: ClientMessage) -> Result<()> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        self.state.sent.lock().unwrap().push(message);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, init: &InitParams) -> Result<mpsc::Receiver<StreamMessage>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.state.inbound.lock().unwrap() = Some(tx);
        *self.state.init.lock().unwrap() = Some(init.clone());
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.record(message)
    }

    async fn send_confirmed(&self, message: ClientMessage) -> Result<()> {
        self.record(message)
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.inbound.lock().unwrap().take();
    }
}

impl ServerHandle {
    /// Deliver a message as if it came from the server
    pub async fn inject(&self, message: StreamMessage) {
        let tx = self
            .state
            .inbound
            .lock()
            .unwrap()
            .clone()
            .expect("transport not connected");
        tx.send(message).await.expect("controller dropped inbound");
    }

    /// Simulate the socket dropping without closing the inbound channel
    pub fn disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
    }

    /// Simulate the server going away: the inbound channel ends
    pub fn hang_up(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.inbound.lock().unwrap().take();
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn init(&self) -> Option<InitParams> {
        self.state.init.lock().unwrap().clone()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(ClientMessage::kind).collect()
    }

    #[must_use]
    pub fn audio_sent(&self) -> usize {
        self.sent_kinds().iter().filter(|k| **k == "audio").count()
    }
}

/// 20 ms of silent 24 kHz PCM16 as a server audio message
#[must_use]
pub fn server_audio() -> StreamMessage {
    StreamMessage::from_pcm(vec![0; 960]).expect("even length pcm")
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Sink that finishes every chunk immediately and remembers it
#[derive(Clone, Default)]
pub struct RecordingSink {
    played: Arc<Mutex<Vec<AudioChunk>>>,
}

impl RecordingSink {
    #[must_use]
    pub fn played(&self) -> Vec<AudioChunk> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, chunk: &AudioChunk, _halt: CancellationToken) -> Result<()> {
        self.played.lock().unwrap().push(chunk.clone());
        Ok(())
    }
}

/// Sink that holds each chunk until it is halted or released
#[derive(Clone, Default)]
pub struct BlockingSink {
    started: Arc<AtomicUsize>,
    halted: Arc<AtomicUsize>,
    release: CancellationToken,
}

impl BlockingSink {
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn halted(&self) -> usize {
        self.halted.load(Ordering::SeqCst)
    }

    /// Let the current and every later chunk finish normally
    pub fn release(&self) {
        self.release.cancel();
    }
}

#[async_trait]
impl AudioSink for BlockingSink {
    async fn play(&self, _chunk: &AudioChunk, halt: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            biased;

            () = halt.cancelled() => {
                self.halted.fetch_add(1, Ordering::SeqCst);
            }
            () = self.release.cancelled() => {}
        }
        Ok(())
    }
}
