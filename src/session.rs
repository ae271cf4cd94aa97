//! Production wiring of a voice session
//!
//! Builds the cpal capture source, the WebSocket transport, and the speaker
//! sink from [`Config`], and owns the controller task.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::transport::{StreamingTransport, new_session_id};
use crate::turn::{FunctionCallDispatcher, TurnController, TurnHandle};
use crate::voice::{CpalCapture, CpalSink, PlaybackBuffer};
use crate::Result;

/// A running voice session backed by real audio devices
pub struct VoiceSession {
    id: String,
    handle: TurnHandle,
    dispatcher: FunctionCallDispatcher,
    task: JoinHandle<()>,
}

impl VoiceSession {
    /// Build the session components and start the controller task
    ///
    /// The session still needs [`TurnHandle::initialize`] before listening.
    ///
    /// # Errors
    ///
    /// Returns error if there is no output device or the configuration is
    /// invalid
    pub fn start(config: &Config) -> Result<Self> {
        let id = new_session_id();
        let url = config.endpoint(&id)?;

        let transport =
            StreamingTransport::new(url).with_handshake_timeout(config.server.handshake_timeout);
        let capture = CpalCapture::new(config.audio.frame_size);
        let playback = PlaybackBuffer::new(Arc::new(CpalSink::new()?));
        let dispatcher = FunctionCallDispatcher::new();

        let (controller, handle) = TurnController::new(
            config.turn_settings(),
            Box::new(capture),
            Box::new(transport),
            playback,
            dispatcher.clone(),
        )?;

        tracing::info!(
            session_id = %id,
            tenant_id = %config.session.tenant_id,
            module = %config.session.module,
            "voice session created"
        );

        Ok(Self {
            id,
            handle,
            dispatcher,
            task: controller.spawn(),
        })
    }

    /// Session id used in the endpoint path
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle for driving the session
    #[must_use]
    pub const fn handle(&self) -> &TurnHandle {
        &self.handle
    }

    /// Registry for function call handlers
    #[must_use]
    pub const fn dispatcher(&self) -> &FunctionCallDispatcher {
        &self.dispatcher
    }

    /// Dispose the session and wait for the controller task to finish
    ///
    /// # Errors
    ///
    /// Returns error if dispose fails
    pub async fn shutdown(self) -> Result<()> {
        self.handle.dispose().await?;
        if let Err(e) = self.task.await {
            tracing::warn!(session_id = %self.id, error = %e, "controller task ended abnormally");
        }
        Ok(())
    }
}
