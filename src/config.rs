//! Configuration types for the relay pipeline.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Default TCP port the relay listens on.
pub const DEFAULT_PORT: u16 = 7777;

/// Layout of interleaved 32-bit float PCM.
///
/// Describes both what a capture source produces and what the encoder reads on standard
/// input. Captured audio is converted from the former to the latter; on the encoder pipe the
/// samples are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

impl PcmFormat {
    /// 48kHz stereo, what `oggenc2 --raw-rate=48000` expects by default.
    pub const STUDIO: Self = Self {
        sample_rate: 48_000,
        channels: 2,
    };

    /// Creates a new PCM format.
    #[must_use]
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes occupied by one second of audio in this format.
    #[must_use]
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * std::mem::size_of::<f32>()
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::STUDIO
    }
}

/// Configuration for the single-client relay.
///
/// # Example
///
/// ```
/// use stream_relay::RelayConfig;
///
/// let config = RelayConfig {
///     chunk_size: 1024,
///     ..Default::default()
/// };
/// assert_eq!(config.bind_addr.port(), 7777);
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Size in bytes of every chunk forwarded to the client.
    ///
    /// Default: 512
    pub chunk_size: usize,

    /// Address the listener binds to. Port 0 picks an ephemeral port.
    ///
    /// Default: `0.0.0.0:7777`
    pub bind_addr: SocketAddr,

    /// Size of the buffer used to read (and discard) whatever the client sends.
    ///
    /// Reading keeps disconnects observable; the payload is never interpreted.
    /// Default: 4096
    pub liveness_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            liveness_buffer_size: 4096,
        }
    }
}

/// Configuration for session timing and buffering.
///
/// Use [`PipelineConfig::default()`] for sensible defaults, or customize as needed.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Amount of captured audio the ring buffer can hold before samples are dropped.
    ///
    /// Default: 5 seconds
    pub ring_buffer_duration: Duration,

    /// How often the capture bridge drains the ring buffer into the encoder.
    ///
    /// Default: 10ms
    pub bridge_poll_interval: Duration,

    /// How long `stop()` waits for the encoder to flush its output after its input closes.
    ///
    /// Default: 2 seconds
    pub drain_timeout: Duration,

    /// How long `stop()` waits for the encoder to exit before killing it.
    ///
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_buffer_duration: Duration::from_secs(5),
            bridge_poll_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_format_default() {
        let format = PcmFormat::default();
        assert_eq!(format.sample_rate, 48_000);
        assert_eq!(format.channels, 2);
    }

    #[test]
    fn test_input_format_bytes_per_second() {
        assert_eq!(PcmFormat::STUDIO.bytes_per_second(), 48_000 * 2 * 4);
        assert_eq!(PcmFormat::new(16_000, 1).bytes_per_second(), 64_000);
    }

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.bind_addr.port(), 7777);
        assert!(config.bind_addr.ip().is_unspecified());
        assert_eq!(config.liveness_buffer_size, 4096);
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.ring_buffer_duration, Duration::from_secs(5));
        assert_eq!(config.bridge_poll_interval, Duration::from_millis(10));
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }
}
