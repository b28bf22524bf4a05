//! Audio pipeline components.
//!
//! The pipeline connects the capture source to the network client:
//!
//! ```text
//! CPAL Thread → Ring Buffer → Capture Bridge → Encoder → ChunkAccumulator → Relay → Client
//! ```
//!
//! - **Ring Buffer**: Lock-free SPSC queue, the capture callback never blocks
//! - **Capture Bridge**: Reads from the buffer, converts format, writes encoder stdin
//! - **Encoder**: External process, its stdout is cut into fixed-size chunks
//! - **Relay**: Forwards every chunk to the single connected client

mod bridge;

pub(crate) use bridge::{spawn_capture_bridge, CaptureBridge};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::session::{Session, SessionParams, SessionStats};
use crate::{CapturePipelineBuilder, StreamRelayError};

/// Capture → encode → relay lifecycle.
///
/// A pipeline is either idle or capturing. [`start()`](Self::start) spawns the encoder,
/// opens the capture source (paused) and binds the relay; capture only begins once a client
/// connects. [`stop()`](Self::stop) tears everything down in pipeline order and leaves the
/// pipeline idle again, ready for another `start()`.
///
/// Transitions are serialized: a `start()` racing a `stop()` waits for it to finish.
///
/// # Example
///
/// ```no_run
/// use stream_relay::{AudioSource, CapturePipeline};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), stream_relay::StreamRelayError> {
/// let pipeline = CapturePipeline::builder()
///     .source(AudioSource::loopback())
///     .port(7777)
///     .on_event(|event| println!("{event:?}"))
///     .build()?;
///
/// pipeline.start().await?;
/// tokio::signal::ctrl_c().await.ok();
/// pipeline.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct CapturePipeline {
    params: SessionParams,
    session: Mutex<Option<Session>>,
    capturing: AtomicBool,
    relay_addr: SyncMutex<Option<SocketAddr>>,
}

impl CapturePipeline {
    /// Creates a new builder for configuring the pipeline.
    pub fn builder() -> CapturePipelineBuilder {
        CapturePipelineBuilder::new()
    }

    pub(crate) fn from_params(params: SessionParams) -> Self {
        Self {
            params,
            session: Mutex::new(None),
            capturing: AtomicBool::new(false),
            relay_addr: SyncMutex::new(None),
        }
    }

    /// Starts a session.
    ///
    /// # Errors
    ///
    /// - [`StreamRelayError::AlreadyCapturing`] if a session is running
    /// - Any error acquiring the encoder, the capture source or the listener. Everything
    ///   acquired before the failure is released and the pipeline stays idle.
    pub async fn start(&self) -> Result<(), StreamRelayError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(StreamRelayError::AlreadyCapturing);
        }

        let started = Session::start(self.params.clone()).await?;
        *self.relay_addr.lock() = Some(started.relay_addr());
        *session = Some(started);
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the running session.
    ///
    /// The pipeline is idle afterwards even if an error is returned.
    ///
    /// # Errors
    ///
    /// - [`StreamRelayError::NotCapturing`] if no session is running
    /// - [`StreamRelayError::EncoderExit`] or [`StreamRelayError::EncoderTimeout`] if the
    ///   encoder did not shut down cleanly
    pub async fn stop(&self) -> Result<(), StreamRelayError> {
        let mut session = self.session.lock().await;
        let Some(running) = session.take() else {
            return Err(StreamRelayError::NotCapturing);
        };
        self.capturing.store(false, Ordering::SeqCst);
        *self.relay_addr.lock() = None;
        running.stop().await
    }

    /// Returns `true` while a session is running.
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Returns the address the relay of the running session listens on.
    ///
    /// Useful when binding port 0.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        *self.relay_addr.lock()
    }

    /// Returns statistics of the running session.
    pub async fn stats(&self) -> Option<SessionStats> {
        self.session.lock().await.as_ref().map(Session::stats)
    }
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("source", &self.params.source)
            .field("encoder", &self.params.encoder.program)
            .field("capturing", &self.is_capturing())
            .field("relay_addr", &self.relay_addr())
            .finish()
    }
}
