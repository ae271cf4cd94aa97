//! WebSocket transport

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::Transport;
use super::message::{ClientMessage, InitParams, StreamMessage, parse_server_message};
use crate::{Error, Result};

/// Bound on dial plus `connected` handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on a confirmed send reaching the socket
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Outbound {
    Message {
        message: ClientMessage,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Close,
}

/// Transport over a single WebSocket connection
///
/// Outbound messages are drained by one task and inbound frames are
/// classified by another; the handle only holds channel ends and flags.
pub struct StreamingTransport {
    url: Url,
    handshake_timeout: Duration,
    send_timeout: Duration,
    outbound: Option<mpsc::Sender<Outbound>>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamingTransport {
    /// Create a transport for the given endpoint
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    /// Override the handshake timeout
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Override the confirmed send timeout
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Endpoint this transport dials
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    async fn handshake(&self, init: &InitParams) -> Result<WsStream> {
        let (mut ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("failed to connect: {e}")))?;

        let init_json = ClientMessage::Init(init.clone()).to_json()?;
        ws.send(WsMessage::Text(init_json.into()))
            .await
            .map_err(|e| Error::Connection(format!("failed to send init: {e}")))?;

        while let Some(frame) = ws.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    String::from_utf8_lossy(&data).into_owned()
                }
                Ok(WsMessage::Close(frame)) => {
                    return Err(Error::Connection(format!(
                        "connection closed before connected: {frame:?}"
                    )));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(Error::Connection(format!(
                        "websocket error before connected: {e}"
                    )));
                }
            };

            match parse_server_message(&text) {
                Ok(StreamMessage::Connected) => return Ok(ws),
                Ok(StreamMessage::Error(error)) => {
                    return Err(Error::Connection(format!("server rejected session: {error}")));
                }
                Ok(other) => {
                    tracing::debug!(kind = other.kind(), "ignoring message before connected");
                }
                Err(e) => tracing::warn!(error = %e, "malformed handshake message"),
            }
        }

        Err(Error::Connection(
            "stream ended before connected".to_string(),
        ))
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    async fn connect(&mut self, init: &InitParams) -> Result<mpsc::Receiver<StreamMessage>> {
        if self.is_connected() {
            self.close().await;
        }

        tracing::info!(url = %self.url, module = %init.module, "connecting to voice service");

        let ws = tokio::time::timeout(self.handshake_timeout, self.handshake(init))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "handshake timed out after {}s",
                    self.handshake_timeout.as_secs()
                ))
            })??;

        let (sink, stream) = ws.split();
        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        self.tasks = vec![
            tokio::spawn(outbound_loop(outbound_rx, sink, Arc::clone(&connected))),
            tokio::spawn(inbound_loop(
                stream,
                inbound_tx,
                Arc::clone(&connected),
                Arc::clone(&closing),
            )),
        ];
        self.outbound = Some(outbound_tx);
        self.connected = connected;
        self.closing = closing;

        tracing::info!(url = %self.url, "voice service connected");
        Ok(inbound_rx)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or(Error::NotConnected)?;

        // Never wait on a stalled socket; the caller drops what does not fit
        match outbound.try_send(Outbound::Message { message, ack: None }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(Error::Connection("outbound queue full".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(Error::NotConnected),
        }
    }

    async fn send_confirmed(&self, message: ClientMessage) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or(Error::NotConnected)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let confirmed = async {
            outbound
                .send(Outbound::Message {
                    message,
                    ack: Some(ack_tx),
                })
                .await
                .map_err(|_| Error::NotConnected)?;
            ack_rx.await.map_err(|_| Error::NotConnected)?
        };

        tokio::time::timeout(self.send_timeout, confirmed)
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "send timed out after {}ms",
                    self.send_timeout.as_millis()
                ))
            })?
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        self.closing.store(true, Ordering::Release);

        // A full queue means the socket is stalled; the grace period below
        // bounds the wait and the tasks are aborted after it
        if let Some(outbound) = self.outbound.take()
            && outbound.try_send(Outbound::Close).is_err()
        {
            tracing::debug!("outbound queue unavailable, closing without close frame");
        }

        let deadline = tokio::time::Instant::now() + CLOSE_GRACE;
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                tracing::debug!("transport task did not stop in time, aborting");
                abort.abort();
            }
        }

        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::info!(url = %self.url, "voice service disconnected");
        }
    }
}

impl Drop for StreamingTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn outbound_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WsStream, WsMessage>,
    connected: Arc<AtomicBool>,
) {
    let mut audio_frames: u64 = 0;

    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message { message, ack } => {
                if matches!(message, ClientMessage::Audio { .. }) {
                    audio_frames += 1;
                    if audio_frames == 1 || audio_frames.is_multiple_of(50) {
                        tracing::debug!(frames = audio_frames, "sending audio");
                    }
                } else {
                    tracing::debug!(kind = message.kind(), "sending message");
                }

                let result = match message.to_json() {
                    Ok(json) => sink
                        .send(WsMessage::Text(json.into()))
                        .await
                        .map_err(|e| Error::Connection(format!("send failed: {e}"))),
                    Err(e) => Err(e),
                };

                let failed = matches!(result, Err(Error::Connection(_)));
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "outbound message not sent");
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
                if failed {
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
    tracing::debug!(audio_frames, "outbound loop terminated");
}

async fn inbound_loop(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<StreamMessage>,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    let mut audio_chunks: u64 = 0;
    let mut failure = None;

    while let Some(frame) = stream.next().await {
        let parsed = match frame {
            Ok(WsMessage::Text(text)) => parse_server_message(text.as_str()),
            Ok(WsMessage::Binary(data)) => {
                if data.is_empty() {
                    continue;
                }
                if data.first() == Some(&b'{') {
                    match std::str::from_utf8(&data) {
                        Ok(text) => parse_server_message(text),
                        Err(e) => Err(Error::Protocol(format!("binary json is not utf-8: {e}"))),
                    }
                } else {
                    StreamMessage::from_pcm(data.to_vec())
                }
            }
            Ok(WsMessage::Close(frame)) => {
                tracing::info!(close_frame = ?frame, "voice service closed connection");
                failure = Some("connection closed by server".to_string());
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(error = %e, "websocket error");
                failure = Some(format!("websocket error: {e}"));
                break;
            }
        };

        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                continue;
            }
        };

        if matches!(message, StreamMessage::AudioChunk { .. }) {
            audio_chunks += 1;
            if audio_chunks == 1 || audio_chunks.is_multiple_of(50) {
                tracing::debug!(chunks = audio_chunks, "received audio");
            }
        } else {
            tracing::debug!(kind = message.kind(), "received message");
        }

        if tx.send(message).await.is_err() {
            tracing::debug!("inbound receiver dropped");
            break;
        }
    }

    connected.store(false, Ordering::Release);

    if !closing.load(Ordering::Acquire) {
        let reason = failure.unwrap_or_else(|| "connection lost".to_string());
        let _ = tx.send(StreamMessage::Error(reason)).await;
    }
    tracing::debug!(audio_chunks, "inbound loop terminated");
}
