//! Streaming connection to the voice assistant service
//!
//! A [`Transport`] carries the tagged JSON protocol in both directions.
//! [`StreamingTransport`] speaks it over a WebSocket.

mod client;
mod message;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

pub use client::{DEFAULT_HANDSHAKE_TIMEOUT, StreamingTransport};
pub use message::{ClientMessage, InitParams, StreamMessage, decode_audio, parse_server_message};

use crate::{Error, Result};

/// Bidirectional message channel to the assistant
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel and send `init`
    ///
    /// Returns the receiver for classified inbound messages. The receiver
    /// yields `None` once the connection is gone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if dialing or the handshake fails
    async fn connect(&mut self, init: &InitParams) -> Result<mpsc::Receiver<StreamMessage>>;

    /// Queue a message for sending without waiting on the network
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the channel is closed, or
    /// [`Error::Connection`] if the outbound queue is full
    async fn send(&self, message: ClientMessage) -> Result<()>;

    /// Send a message and wait until it has been written to the socket
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the channel is closed or the write
    /// fails, or [`Error::Connection`] if the write does not complete in time
    async fn send_confirmed(&self, message: ClientMessage) -> Result<()>;

    /// Check if the channel is open
    fn is_connected(&self) -> bool;

    /// Close the channel; safe to call repeatedly
    async fn close(&mut self);
}

/// Build the session endpoint `<base>/ws/<feature>/<tenant>/<session>`
///
/// Path segments are percent-encoded. `http`/`https` bases are mapped to
/// `ws`/`wss`.
///
/// # Errors
///
/// Returns [`Error::Config`] if the base URL is invalid or a segment is empty
pub fn endpoint_url(base: &str, feature: &str, tenant_id: &str, session_id: &str) -> Result<Url> {
    let mut url =
        Url::parse(base).map_err(|e| Error::Config(format!("invalid server url {base}: {e}")))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(Error::Config(format!("unsupported url scheme: {other}")));
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(Error::Config(format!("cannot use {base} as websocket url")));
    }

    for (name, value) in [
        ("feature", feature),
        ("tenant id", tenant_id),
        ("session id", session_id),
    ] {
        if value.trim().is_empty() {
            return Err(Error::Config(format!("{name} must not be empty")));
        }
    }

    url.path_segments_mut()
        .map_err(|()| Error::Config(format!("server url cannot be a base: {base}")))?
        .pop_if_empty()
        .extend(["ws", feature, tenant_id, session_id]);
    url.set_query(None);

    Ok(url)
}

/// Fresh random session id
#[must_use]
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
