//! Builder pattern for `CapturePipeline`.

use std::net::SocketAddr;

use crate::session::SessionParams;
use crate::source::AudioSource;
use crate::{
    event_callback, CapturePipeline, EncoderConfig, EventCallback, PipelineConfig, PipelineEvent,
    RelayConfig, StreamRelayError,
};

/// Builder for configuring a [`CapturePipeline`].
///
/// Use [`CapturePipeline::builder()`] to create a new builder.
///
/// # Example
///
/// ```
/// use stream_relay::source::MockSource;
/// use stream_relay::{AudioSource, CapturePipeline, EncoderConfig};
///
/// let mut mock = MockSource::new(48_000, 2);
/// mock.generate_sine(440.0, 500);
///
/// let pipeline = CapturePipeline::builder()
///     .source(AudioSource::mock(mock))
///     .encoder(EncoderConfig::passthrough())
///     .bind_addr(([127, 0, 0, 1], 0))
///     .chunk_size(1024)
///     .build()
///     .unwrap();
/// assert!(!pipeline.is_capturing());
/// ```
#[must_use]
pub struct CapturePipelineBuilder {
    source: AudioSource,
    encoder: EncoderConfig,
    relay: RelayConfig,
    config: PipelineConfig,
    event_callback: Option<EventCallback>,
}

impl Default for CapturePipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturePipelineBuilder {
    /// Creates a new builder with default settings: loopback capture, `oggenc2`, port 7777.
    pub fn new() -> Self {
        Self {
            source: AudioSource::default(),
            encoder: EncoderConfig::default(),
            relay: RelayConfig::default(),
            config: PipelineConfig::default(),
            event_callback: None,
        }
    }

    /// Set where audio is captured from.
    ///
    /// Default: [`AudioSource::Loopback`]
    pub fn source(mut self, source: AudioSource) -> Self {
        self.source = source;
        self
    }

    /// Set the encoder program.
    ///
    /// Default: [`EncoderConfig::oggenc()`]
    pub fn encoder(mut self, encoder: EncoderConfig) -> Self {
        self.encoder = encoder;
        self
    }

    /// Set the size of the chunks forwarded to the client.
    ///
    /// Default: 512 bytes
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.relay.chunk_size = chunk_size;
        self
    }

    /// Set the address the relay listens on.
    pub fn bind_addr(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.relay.bind_addr = addr.into();
        self
    }

    /// Set only the relay port, keeping the bind interface.
    pub fn port(mut self, port: u16) -> Self {
        self.relay.bind_addr.set_port(port);
        self
    }

    /// Set custom relay configuration.
    pub fn relay_config(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Set custom timing and buffering configuration.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a callback to receive runtime events.
    ///
    /// Events include client connects and disconnects, capture start, buffer overflows and
    /// send failures.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Validates the builder configuration.
    fn validate(&self) -> Result<(), StreamRelayError> {
        if self.relay.chunk_size == 0 {
            return Err(StreamRelayError::InvalidChunkSize {
                size: self.relay.chunk_size,
            });
        }
        Ok(())
    }

    /// Creates the pipeline. Nothing is acquired until [`CapturePipeline::start()`].
    ///
    /// # Errors
    ///
    /// Returns [`StreamRelayError::InvalidChunkSize`] for a zero chunk size.
    pub fn build(self) -> Result<CapturePipeline, StreamRelayError> {
        self.validate()?;
        Ok(CapturePipeline::from_params(SessionParams {
            source: self.source,
            encoder: self.encoder,
            relay: self.relay,
            pipeline: self.config,
            event_callback: self.event_callback,
        }))
    }
}
