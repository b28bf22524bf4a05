//! Error types for stream-relay.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`StreamRelayError`]): Fail a pipeline start/stop transition
//! - **Transport errors** ([`TransportError`]): Per-send or per-connection trouble, surfaced via
//!   [`EventCallback`](crate::EventCallback) while the session keeps running

use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

/// Fatal errors that fail a lifecycle transition.
///
/// These are returned from [`CapturePipeline::start()`], [`CapturePipeline::stop()`] and the
/// constructors of the individual components. A failed start always leaves the pipeline idle
/// with every partially acquired resource released.
///
/// [`CapturePipeline::start()`]: crate::CapturePipeline::start
/// [`CapturePipeline::stop()`]: crate::CapturePipeline::stop
#[derive(Debug, thiserror::Error)]
pub enum StreamRelayError {
    /// A session is already running on this pipeline.
    #[error("capture session already active")]
    AlreadyCapturing,

    /// `stop()` was called while no session is running.
    #[error("no capture session is active")]
    NotCapturing,

    /// The configured chunk size cannot be used.
    #[error("invalid chunk size: {size} (must be greater than zero)")]
    InvalidChunkSize {
        /// The rejected size.
        size: usize,
    },

    /// The encoder process could not be launched.
    #[error("failed to spawn encoder '{program}': {source}")]
    EncoderSpawn {
        /// Program that was being launched.
        program: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The encoder was launched without one of its redirected pipes.
    #[error("encoder '{program}' has no {pipe} pipe")]
    EncoderPipe {
        /// Program that was launched.
        program: String,
        /// Which pipe is missing (`stdin` or `stdout`).
        pipe: &'static str,
    },

    /// The encoder process exited unsuccessfully.
    #[error("encoder '{program}' exited with {status}")]
    EncoderExit {
        /// Program that exited.
        program: String,
        /// Its exit status.
        status: ExitStatus,
    },

    /// The encoder did not exit within the shutdown timeout and was killed.
    #[error("encoder '{program}' did not exit within {timeout:?}")]
    EncoderTimeout {
        /// Program that was killed.
        program: String,
        /// How long we waited.
        timeout: Duration,
    },

    /// Waiting on or killing the encoder process failed.
    #[error("encoder process error: {0}")]
    EncoderIo(#[source] std::io::Error),

    /// The relay could not bind its listening socket.
    #[error("failed to bind relay listener on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The requested audio device was not found.
    #[error("device not found: {name}")]
    DeviceNotFound {
        /// Name of the device that wasn't found.
        name: String,
    },

    /// No default input device is configured on this system.
    #[error("no default input device configured")]
    NoDefaultDevice,

    /// No default output device exists to capture in loopback mode.
    #[error("no default output device configured for loopback capture")]
    NoDefaultOutputDevice,

    /// The device produces a sample format we cannot convert.
    #[error("unsupported sample format: {format}")]
    UnsupportedFormat {
        /// The format that wasn't supported.
        format: String,
    },

    /// An error from the underlying audio library (CPAL).
    #[error("audio backend error: {0}")]
    BackendError(String),

    /// The thread hosting the capture stream stopped responding.
    #[error("capture thread unavailable: {0}")]
    CaptureThread(String),
}

/// Recoverable transport errors on the relay side.
///
/// These never fail a lifecycle transition. The relay reports them through
/// [`PipelineEvent`](crate::PipelineEvent) and either keeps going or marks the client as
/// disconnected.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Writing a chunk to the client failed; later chunks are still attempted.
    #[error("send to {peer} failed: {source}")]
    SendFailed {
        /// The connected client.
        peer: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The client connection is gone.
    #[error("connection to {peer} lost: {reason}")]
    ConnectionLost {
        /// The client that went away.
        peer: SocketAddr,
        /// What we observed.
        reason: String,
    },

    /// The listener failed before a client connected.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),
}

impl TransportError {
    /// Returns `true` if the error means the client connection cannot be used any more.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::ConnectionLost { .. } => true,
            Self::SendFailed { source, .. } => is_disconnect(source),
            Self::AcceptFailed(_) => false,
        }
    }
}

/// Classifies an I/O error from a socket write as connection-ending.
pub(crate) fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::WriteZero
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_stream_relay_error_display() {
        let err = StreamRelayError::DeviceNotFound {
            name: "USB Mic".to_string(),
        };
        assert_eq!(err.to_string(), "device not found: USB Mic");
    }

    #[test]
    fn test_invalid_chunk_size_display() {
        let err = StreamRelayError::InvalidChunkSize { size: 0 };
        assert!(err.to_string().contains("invalid chunk size: 0"));
    }

    #[test]
    fn test_bind_error_carries_address() {
        let addr: SocketAddr = "127.0.0.1:7777".parse().unwrap();
        let err = StreamRelayError::Bind {
            addr,
            source: Error::new(ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:7777"));
    }

    #[test]
    fn test_send_failed_classification() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let reset = TransportError::SendFailed {
            peer,
            source: Error::new(ErrorKind::ConnectionReset, "reset"),
        };
        assert!(reset.is_connection_lost());

        let transient = TransportError::SendFailed {
            peer,
            source: Error::new(ErrorKind::Interrupted, "interrupted"),
        };
        assert!(!transient.is_connection_lost());
    }

    #[test]
    fn test_accept_failure_is_not_a_disconnect() {
        let err = TransportError::AcceptFailed(Error::new(ErrorKind::PermissionDenied, "denied"));
        assert!(!err.is_connection_lost());
        assert_eq!(err.to_string(), "accept failed: denied");
    }
}
