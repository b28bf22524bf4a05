//! Runtime events for monitoring a relay session.
//!
//! Events are non-fatal notifications. The session keeps running after any of them is
//! emitted; they exist for logging and UI feedback, not for error handling.

use std::net::SocketAddr;
use std::sync::Arc;

/// Runtime events emitted while a session is live.
///
/// # Example
///
/// ```
/// use stream_relay::PipelineEvent;
///
/// fn handle_event(event: PipelineEvent) {
///     match event {
///         PipelineEvent::ClientConnected { peer } => eprintln!("client {peer} connected"),
///         PipelineEvent::ClientDisconnected { peer, reason } => {
///             eprintln!("client {peer} went away: {reason}");
///         }
///         PipelineEvent::CaptureStarted { source } => eprintln!("capturing from {source}"),
///         PipelineEvent::CaptureFailed { reason } => eprintln!("capture failed: {reason}"),
///         PipelineEvent::BufferOverflow { dropped_samples } => {
///             eprintln!("dropped {dropped_samples} samples");
///         }
///         PipelineEvent::EncoderInputClosed { reason } => eprintln!("encoder input: {reason}"),
///         PipelineEvent::StreamEnded { chunks, discarded_bytes } => {
///             eprintln!("encoder output ended after {chunks} chunks ({discarded_bytes} bytes left over)");
///         }
///         PipelineEvent::SendFailed { error } => eprintln!("send failed: {error}"),
///         PipelineEvent::RelayFailed { error } => eprintln!("relay failed: {error}"),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The relay accepted its one client.
    ///
    /// Emitted at most once per session.
    ClientConnected {
        /// Address of the client.
        peer: SocketAddr,
    },

    /// The client closed the connection or the connection broke.
    ///
    /// Chunks produced afterwards are dropped. The relay never accepts a replacement.
    ClientDisconnected {
        /// Address of the client.
        peer: SocketAddr,
        /// What we observed.
        reason: String,
    },

    /// Audio capture began (after the client connected).
    CaptureStarted {
        /// Name of the capture source.
        source: String,
    },

    /// Starting the capture source failed after the client connected.
    ///
    /// The session stays up; call `stop()` to tear it down.
    CaptureFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The capture ring buffer was full and samples were lost.
    BufferOverflow {
        /// Samples dropped since the previous report.
        dropped_samples: u64,
    },

    /// Writing to the encoder's standard input failed; no more audio reaches the encoder.
    EncoderInputClosed {
        /// Description of the failure.
        reason: String,
    },

    /// The encoder's output stream ended.
    StreamEnded {
        /// Chunks cut from the stream.
        chunks: u64,
        /// Trailing bytes that did not fill a whole chunk.
        discarded_bytes: usize,
    },

    /// A send to the client failed but the connection is still considered usable.
    SendFailed {
        /// Description of the error.
        error: String,
    },

    /// The listener failed; no client will ever be accepted by this relay.
    RelayFailed {
        /// Description of the error.
        error: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register one via [`CapturePipelineBuilder::on_event()`].
///
/// [`CapturePipelineBuilder::on_event()`]: crate::CapturePipelineBuilder::on_event
pub type EventCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use stream_relay::{event_callback, PipelineEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// callback(PipelineEvent::BufferOverflow { dropped_samples: 3 });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(PipelineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Sends an event to an optional callback.
pub(crate) fn emit(callback: Option<&EventCallback>, event: PipelineEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}
