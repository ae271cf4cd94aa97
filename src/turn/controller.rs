//! Turn-taking state machine
//!
//! [`TurnController`] owns the capture source, the VAD, the transport, and
//! the playback buffer. It runs as a single task that multiplexes host
//! commands, inbound server messages, and capture frames, so every state
//! transition is serialized. Hosts talk to it through a cloneable
//! [`TurnHandle`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::dispatcher::FunctionCallDispatcher;
use super::state::{SessionEvent, TurnState};
use crate::transport::{ClientMessage, InitParams, StreamMessage, Transport, decode_audio};
use crate::vad::{CalibrationProfile, VadConfig, VadResult, VoiceActivityDetector};
use crate::voice::codec::encode_samples;
use crate::voice::{AudioFrame, FrameQueue, FrameSource, PlaybackBuffer};
use crate::{Error, Result};

/// Default frame queue depth between capture and controller
pub const DEFAULT_FRAME_QUEUE_DEPTH: usize = 8;

/// Default amount of audio sampled for calibration
pub const DEFAULT_CALIBRATION_WINDOW: Duration = Duration::from_secs(1);

/// Wall-clock bound on a calibration pass
pub const CALIBRATION_DEADLINE: Duration = Duration::from_secs(3);

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Controller tuning
#[derive(Debug, Clone, PartialEq)]
pub struct TurnSettings {
    /// Parameters sent in the `init` message
    pub init: InitParams,
    /// Detector configuration
    pub vad: VadConfig,
    /// Frames buffered between capture and controller
    pub frame_queue_depth: usize,
    /// Audio collected by `calibrate`
    pub calibration_window: Duration,
    /// Wall-clock limit for `calibrate`
    pub calibration_deadline: Duration,
    /// Interrupt playback automatically when the user starts speaking
    pub auto_barge_in: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            init: InitParams::default(),
            vad: VadConfig::default(),
            frame_queue_depth: DEFAULT_FRAME_QUEUE_DEPTH,
            calibration_window: DEFAULT_CALIBRATION_WINDOW,
            calibration_deadline: CALIBRATION_DEADLINE,
            auto_barge_in: false,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Initialize(Reply<()>),
    StartListening(Reply<()>),
    StopListening(Reply<()>),
    InterruptSpeech(Reply<()>),
    SendText(String, Reply<()>),
    Calibrate(Reply<CalibrationProfile>),
    Dispose(Reply<()>),
}

/// Cloneable handle for driving a [`TurnController`]
#[derive(Clone)]
pub struct TurnHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<TurnState>,
    events: broadcast::Sender<SessionEvent>,
}

impl TurnHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Acquire the microphone and connect to the service
    ///
    /// Also the only way out of [`TurnState::Error`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] or [`Error::Connection`]; the
    /// session is left in [`TurnState::Error`]
    pub async fn initialize(&self) -> Result<()> {
        self.request(Command::Initialize).await
    }

    /// Start streaming the user's speech
    ///
    /// From [`TurnState::Speaking`] this interrupts playback first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] outside Idle, Listening, or Speaking
    pub async fn start_listening(&self) -> Result<()> {
        self.request(Command::StartListening).await
    }

    /// End the user's turn now
    ///
    /// Resolves once `end_of_turn` has been written to the socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if not listening, or the send error
    /// with the state unchanged
    pub async fn stop_listening(&self) -> Result<()> {
        self.request(Command::StopListening).await
    }

    /// Cut off the assistant; a no-op unless speaking
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] after dispose
    pub async fn interrupt_speech(&self) -> Result<()> {
        self.request(Command::InterruptSpeech).await
    }

    /// Send a typed user turn
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] outside Idle or Listening, or the
    /// send error
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, reply)).await
    }

    /// Measure ambient noise and set the VAD noise floor
    ///
    /// # Errors
    ///
    /// Returns [`Error::Calibration`] if no usable audio was captured; the
    /// detector then runs on default thresholds
    pub async fn calibrate(&self) -> Result<CalibrationProfile> {
        self.request(Command::Calibrate).await
    }

    /// Release the microphone, close the transport, and drop queued audio
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the controller rejects the request
    pub async fn dispose(&self) -> Result<()> {
        match self.request(Command::Dispose).await {
            Err(Error::SessionClosed) => Ok(()),
            other => other,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<TurnState> {
        self.state.clone()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the controller task has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Per-turn bookkeeping for streamed user audio
///
/// Until speech is confirmed, frames are held back: voiced frames of the
/// current onset in `onset`, and the last few frames before it in `lead_in`.
#[derive(Debug, Default)]
struct TurnTracker {
    lead_in: VecDeque<AudioFrame>,
    onset: Vec<AudioFrame>,
    streaming: bool,
    last_voice_at: Option<Duration>,
    frames_sent: u64,
}

impl TurnTracker {
    fn reset(&mut self) {
        self.lead_in.clear();
        self.onset.clear();
        self.streaming = false;
        self.last_voice_at = None;
        self.frames_sent = 0;
    }

    /// Hold back a frame captured before speech was confirmed
    fn hold(&mut self, frame: AudioFrame, voiced: bool, lead_in: usize) {
        if voiced {
            self.onset.push(frame);
            return;
        }

        // An onset that never confirmed becomes lead-in for the next one
        let broken = std::mem::take(&mut self.onset);
        if lead_in == 0 {
            return;
        }
        for frame in broken.into_iter().chain(std::iter::once(frame)) {
            while self.lead_in.len() >= lead_in {
                self.lead_in.pop_front();
            }
            self.lead_in.push_back(frame);
        }
    }

    /// Everything held back, oldest first
    fn take_held(&mut self) -> Vec<AudioFrame> {
        self.lead_in.drain(..).chain(self.onset.drain(..)).collect()
    }
}

struct PendingCalibration {
    reply: Reply<CalibrationProfile>,
    collected: Duration,
    deadline: Instant,
    stop_capture_after: bool,
}

enum Flow {
    Continue,
    Exit,
}

struct Core {
    settings: TurnSettings,
    capture: Box<dyn FrameSource>,
    transport: Box<dyn Transport>,
    playback: PlaybackBuffer,
    dispatcher: FunctionCallDispatcher,
    vad: VoiceActivityDetector,
    frames: Arc<FrameQueue>,
    inbound: Option<mpsc::Receiver<StreamMessage>>,
    state: watch::Sender<TurnState>,
    events: broadcast::Sender<SessionEvent>,
    initialized: bool,
    turn: TurnTracker,
    calibration: Option<PendingCalibration>,
    reply_complete: bool,
}

/// The session actor
///
/// Build it with [`TurnController::new`], then drive [`TurnController::run`]
/// on a task and talk to it through the returned [`TurnHandle`].
pub struct TurnController {
    commands: mpsc::Receiver<Command>,
    frames: Arc<FrameQueue>,
    core: Core,
}

impl TurnController {
    /// Create a controller and its handle
    ///
    /// Components are injected so hosts and tests can swap in their own
    /// capture sources, transports, and sinks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the VAD configuration is invalid
    pub fn new(
        settings: TurnSettings,
        capture: Box<dyn FrameSource>,
        transport: Box<dyn Transport>,
        playback: PlaybackBuffer,
        dispatcher: FunctionCallDispatcher,
    ) -> Result<(Self, TurnHandle)> {
        let vad = VoiceActivityDetector::new(settings.vad.clone())?;
        let frames = Arc::new(FrameQueue::new(settings.frame_queue_depth));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = TurnHandle {
            commands: command_tx,
            state: state_rx,
            events: events.clone(),
        };

        let core = Core {
            settings,
            capture,
            transport,
            playback,
            dispatcher,
            vad,
            frames: Arc::clone(&frames),
            inbound: None,
            state: state_tx,
            events,
            initialized: false,
            turn: TurnTracker::default(),
            calibration: None,
            reply_complete: false,
        };

        Ok((
            Self {
                commands: command_rx,
                frames,
                core,
            },
            handle,
        ))
    }

    /// Spawn [`Self::run`] on the current runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands, inbound messages, and frames until disposed
    ///
    /// Commands take priority over inbound messages, which take priority
    /// over frames, so an interrupt is applied before any later chunk.
    /// A completed reply leaves Speaking only once playback has drained.
    pub async fn run(self) {
        let Self {
            mut commands,
            frames,
            mut core,
        } = self;

        loop {
            let deadline = core.calibration.as_ref().map(|c| c.deadline);

            let flow = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => core.handle_command(command).await,
                    None => {
                        tracing::debug!("all session handles dropped");
                        core.shutdown().await;
                        Flow::Exit
                    }
                },
                message = recv_inbound(&mut core.inbound) => {
                    core.handle_inbound(message).await;
                    Flow::Continue
                }
                () = reply_drained(&core.playback, core.reply_complete) => {
                    core.finish_reply();
                    Flow::Continue
                }
                () = sleep_until(deadline) => {
                    tracing::warn!("calibration deadline reached");
                    core.finish_calibration();
                    Flow::Continue
                }
                frame = frames.pop() => {
                    core.handle_frame(frame).await;
                    Flow::Continue
                }
            };

            if matches!(flow, Flow::Exit) {
                break;
            }
        }

        tracing::debug!("turn controller stopped");
    }
}

async fn recv_inbound(inbound: &mut Option<mpsc::Receiver<StreamMessage>>) -> Option<StreamMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reply_drained(playback: &PlaybackBuffer, reply_complete: bool) {
    if reply_complete {
        playback.wait_idle().await;
    } else {
        std::future::pending::<()>().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Core {
    fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    fn set_state(&self, next: TurnState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "turn state changed");
            let _ = self.events.send(SessionEvent::StateChanged {
                from: previous,
                to: next,
            });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, reason: &str) {
        tracing::error!(state = %self.state(), reason, "voice session failed");
        self.set_state(TurnState::Error);
        self.emit(SessionEvent::Error(reason.to_string()));
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        if self.calibration.is_some() {
            match command {
                Command::Dispose(reply) => {
                    self.shutdown().await;
                    let _ = reply.send(Ok(()));
                    return Flow::Exit;
                }
                other => {
                    reject_busy(other);
                    return Flow::Continue;
                }
            }
        }

        match command {
            Command::Initialize(reply) => {
                let _ = reply.send(self.initialize().await);
            }
            Command::StartListening(reply) => {
                let _ = reply.send(self.start_listening().await);
            }
            Command::StopListening(reply) => {
                let _ = reply.send(self.stop_listening().await);
            }
            Command::InterruptSpeech(reply) => {
                if self.state() == TurnState::Speaking {
                    self.interrupt().await;
                    self.turn.reset();
                }
                let _ = reply.send(Ok(()));
            }
            Command::SendText(text, reply) => {
                let _ = reply.send(self.send_text(text).await);
            }
            Command::Calibrate(reply) => self.start_calibration(reply),
            Command::Dispose(reply) => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    async fn initialize(&mut self) -> Result<()> {
        let state = self.state();
        if self.initialized && state != TurnState::Error {
            return Ok(());
        }
        if !matches!(state, TurnState::Idle | TurnState::Error) {
            return Err(Error::InvalidState {
                action: "initialize",
                state,
            });
        }

        self.set_state(TurnState::Connecting);

        if let Err(e) = self.capture.initialize() {
            self.fail(&e.to_string());
            return Err(e);
        }

        if self.transport.is_connected() {
            self.transport.close().await;
        }
        match self.transport.connect(&self.settings.init).await {
            Ok(inbound) => self.inbound = Some(inbound),
            Err(e) => {
                self.fail(&e.to_string());
                return Err(e);
            }
        }

        self.initialized = true;
        self.playback.flush();
        self.vad.reset();
        self.turn.reset();
        self.set_state(TurnState::Idle);
        tracing::info!(module = %self.settings.init.module, "voice session ready");
        Ok(())
    }

    fn ensure_capture(&mut self) -> Result<()> {
        if self.capture.is_capturing() {
            return Ok(());
        }
        let frames = Arc::clone(&self.frames);
        self.capture.start_capture(Box::new(move |frame| {
            frames.push(frame);
        }))?;
        Ok(())
    }

    async fn start_listening(&mut self) -> Result<()> {
        let state = self.state();
        match state {
            TurnState::Listening => return Ok(()),
            TurnState::Idle | TurnState::Speaking if !self.initialized => {
                return Err(Error::NotConnected);
            }
            TurnState::Idle => {
                // Residual playback from a completed turn
                self.playback.flush();
            }
            TurnState::Speaking => self.interrupt().await,
            _ => {
                return Err(Error::InvalidState {
                    action: "start listening",
                    state,
                });
            }
        }

        if let Err(e) = self.ensure_capture() {
            if matches!(e, Error::DeviceUnavailable(_)) {
                self.fail(&e.to_string());
            }
            return Err(e);
        }

        self.frames.clear();
        self.vad.reset();
        self.turn.reset();
        self.set_state(TurnState::Listening);
        Ok(())
    }

    async fn stop_listening(&mut self) -> Result<()> {
        let state = self.state();
        if state != TurnState::Listening {
            return Err(Error::InvalidState {
                action: "stop listening",
                state,
            });
        }
        self.end_turn().await
    }

    /// Send `end_of_turn` and wait for the write before moving to Processing
    async fn end_turn(&mut self) -> Result<()> {
        let frames_sent = self.turn.frames_sent;
        match self.transport.send_confirmed(ClientMessage::EndOfTurn).await {
            Ok(()) => {
                tracing::debug!(frames_sent, "user turn ended");
                self.turn.reset();
                self.vad.reset();
                self.set_state(TurnState::Processing);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send end of turn");
                self.emit(SessionEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn interrupt(&mut self) {
        self.set_state(TurnState::Interrupted);
        let dropped = self.playback.flush();
        if let Err(e) = self.transport.send(ClientMessage::Interrupt).await {
            tracing::warn!(error = %e, "failed to send interrupt");
        }
        tracing::info!(dropped, "assistant speech interrupted");
        self.set_state(TurnState::Idle);
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let state = self.state();
        if !matches!(state, TurnState::Idle | TurnState::Listening) {
            return Err(Error::InvalidState {
                action: "send text",
                state,
            });
        }
        if !self.initialized {
            return Err(Error::NotConnected);
        }

        self.transport.send(ClientMessage::Text { text }).await?;
        self.turn.reset();
        self.vad.reset();
        self.set_state(TurnState::Processing);
        Ok(())
    }

    fn start_calibration(&mut self, reply: Reply<CalibrationProfile>) {
        let state = self.state();
        if state != TurnState::Idle {
            let _ = reply.send(Err(Error::InvalidState {
                action: "calibrate",
                state,
            }));
            return;
        }

        let was_capturing = self.capture.is_capturing();
        if let Err(e) = self.ensure_capture() {
            let _ = reply.send(Err(e));
            return;
        }

        self.frames.clear();
        self.vad.begin_calibration();
        self.calibration = Some(PendingCalibration {
            reply,
            collected: Duration::ZERO,
            deadline: Instant::now() + self.settings.calibration_deadline,
            stop_capture_after: !was_capturing,
        });
    }

    fn finish_calibration(&mut self) {
        let Some(pending) = self.calibration.take() else {
            return;
        };

        let result = self.vad.finish_calibration();
        if let Err(e) = &result {
            tracing::warn!(error = %e, "calibration failed, using default thresholds");
            self.vad.use_defaults();
        }

        if pending.stop_capture_after {
            self.capture.stop_capture();
            self.frames.clear();
        }
        let _ = pending.reply.send(result);
    }

    async fn handle_inbound(&mut self, message: Option<StreamMessage>) {
        let Some(message) = message else {
            self.inbound = None;
            if self.state() != TurnState::Error {
                self.fail("connection to voice service lost");
            }
            return;
        };

        let state = self.state();
        match message {
            StreamMessage::Connected => tracing::debug!("duplicate connected message"),
            StreamMessage::AudioChunk {
                pcm,
                sample_rate_hz,
            } => {
                if !state.accepts_audio() {
                    tracing::trace!(state = %state, bytes = pcm.len(), "dropping stale audio");
                    return;
                }
                let chunk = match decode_audio(&pcm, sample_rate_hz) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable audio");
                        return;
                    }
                };
                if state == TurnState::Processing {
                    self.begin_speaking();
                }
                if let Err(e) = self.playback.enqueue(chunk) {
                    tracing::warn!(error = %e, "failed to enqueue audio");
                }
            }
            StreamMessage::Text(text) => {
                tracing::debug!(len = text.len(), "assistant text");
                self.emit(SessionEvent::Text(text));
                if state == TurnState::Processing {
                    self.begin_speaking();
                }
            }
            StreamMessage::FunctionCall { name, args } => {
                self.dispatcher.dispatch(&name, &args);
                self.emit(SessionEvent::FunctionCall { name });
            }
            StreamMessage::TurnComplete => match state {
                TurnState::Processing => {
                    tracing::debug!("assistant turn complete without audio");
                    self.set_state(TurnState::Idle);
                }
                TurnState::Speaking if self.playback.is_empty() => {
                    tracing::debug!("assistant turn complete");
                    self.set_state(TurnState::Idle);
                }
                TurnState::Speaking => {
                    // Still audible, so interrupts and barge-in stay live
                    tracing::debug!(
                        queued = self.playback.len(),
                        "assistant turn complete, finishing playback"
                    );
                    self.reply_complete = true;
                }
                _ => {}
            },
            StreamMessage::Interrupted => {
                if matches!(state, TurnState::Speaking | TurnState::Processing) {
                    let dropped = self.playback.flush();
                    tracing::info!(dropped, "server interrupted response");
                    self.set_state(TurnState::Idle);
                }
            }
            // The transport drops its connection flag before reporting loss
            StreamMessage::Error(reason) if !self.transport.is_connected() => self.fail(&reason),
            StreamMessage::Error(reason) => self.service_error(&reason),
        }
    }

    /// Error reported by the service over a healthy connection
    ///
    /// Abandons the pending response; the session stays usable.
    fn service_error(&mut self, reason: &str) {
        let state = self.state();
        tracing::warn!(state = %state, reason, "voice service reported an error");
        if matches!(state, TurnState::Processing | TurnState::Speaking) {
            let dropped = self.playback.flush();
            tracing::debug!(dropped, "response abandoned");
            self.set_state(TurnState::Idle);
        }
        self.emit(SessionEvent::Error(reason.to_string()));
    }

    fn begin_speaking(&mut self) {
        self.vad.reset();
        self.turn.reset();
        self.reply_complete = false;
        self.set_state(TurnState::Speaking);
    }

    fn finish_reply(&mut self) {
        if self.state() != TurnState::Speaking {
            self.reply_complete = false;
        } else if self.playback.is_empty() {
            self.reply_complete = false;
            tracing::debug!("assistant playback finished");
            self.set_state(TurnState::Idle);
        }
    }

    async fn handle_frame(&mut self, frame: AudioFrame) {
        if let Some(pending) = self.calibration.as_mut() {
            pending.collected += frame.duration();
            let done = pending.collected >= self.settings.calibration_window;
            self.vad.process(&frame);
            if done {
                self.finish_calibration();
            }
            return;
        }

        match self.state() {
            TurnState::Listening => {
                let result = self.vad.process(&frame);
                self.track_speech(frame, result).await;
            }
            TurnState::Speaking if self.settings.auto_barge_in => {
                let result = self.vad.process(&frame);
                if result.is_speech {
                    tracing::info!("user speech during playback, barging in");
                    self.interrupt().await;
                    self.set_state(TurnState::Listening);
                    self.track_speech(frame, result).await;
                } else {
                    let voiced = self.is_voiced(&result);
                    let pad = self.pad_frames();
                    self.turn.hold(frame, voiced, pad);
                }
            }
            _ => {}
        }
    }

    fn pad_frames(&self) -> usize {
        self.vad.params().positive_speech_pad_frames as usize
    }

    /// Frame counts toward speech, confirmed or not
    fn is_voiced(&self, result: &VadResult) -> bool {
        result.probability >= self.vad.params().vad_threshold
    }

    async fn track_speech(&mut self, frame: AudioFrame, result: VadResult) {
        let timestamp = frame.timestamp();
        let voiced = self.is_voiced(&result);
        if voiced {
            self.turn.last_voice_at = Some(result.timestamp);
        }

        if self.turn.streaming {
            self.send_frame(&frame).await;
        } else if result.is_speech {
            self.turn.streaming = true;
            self.emit(SessionEvent::SpeechStarted);
            let held = self.turn.take_held();
            tracing::debug!(held = held.len(), "streaming user speech");
            for buffered in &held {
                self.send_frame(buffered).await;
            }
            self.send_frame(&frame).await;
        } else {
            let pad = self.pad_frames();
            self.turn.hold(frame, voiced, pad);
        }

        if result.end_of_speech {
            self.emit(SessionEvent::SpeechEnded);
        }

        let hang = Duration::from_millis(u64::from(self.vad.params().silence_duration_ms));
        let turn_over = self.turn.streaming
            && !self.vad.in_speech()
            && self
                .turn
                .last_voice_at
                .is_some_and(|last| timestamp.saturating_sub(last) >= hang);

        if turn_over && self.end_turn().await.is_err() {
            // Wait for fresh speech rather than retrying on every frame
            self.turn.reset();
        }
    }

    async fn send_frame(&mut self, frame: &AudioFrame) {
        let message = ClientMessage::Audio {
            data: encode_samples(frame.samples()),
        };
        match self.transport.send(message).await {
            Ok(()) => {
                self.turn.frames_sent += 1;
                if self.turn.frames_sent == 1 || self.turn.frames_sent.is_multiple_of(50) {
                    tracing::debug!(frames = self.turn.frames_sent, "streamed user audio");
                }
            }
            Err(e) => tracing::trace!(error = %e, "audio frame not sent"),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(pending) = self.calibration.take() {
            let _ = pending.reply.send(Err(Error::SessionClosed));
        }
        self.capture.stop_capture();
        self.frames.clear();
        self.transport.close().await;
        self.inbound = None;
        self.playback.close().await;
        self.initialized = false;
        self.turn.reset();
        self.set_state(TurnState::Idle);
        tracing::info!("voice session disposed");
    }
}

fn reject_busy(command: Command) {
    let err = || Error::Calibration("calibration in progress".to_string());
    match command {
        Command::Initialize(reply)
        | Command::StartListening(reply)
        | Command::StopListening(reply)
        | Command::InterruptSpeech(reply)
        | Command::SendText(_, reply)
        | Command::Dispose(reply) => {
            let _ = reply.send(Err(err()));
        }
        Command::Calibrate(reply) => {
            let _ = reply.send(Err(err()));
        }
    }
}
