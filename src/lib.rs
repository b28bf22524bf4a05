//! # stream-relay
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Live audio capture, piped through an external encoder, relayed to one TCP client.
//!
//! `stream-relay` captures audio via CPAL (by default whatever the system is playing),
//! feeds it as raw float PCM to an encoder process such as `oggenc2`, cuts the encoded
//! output into fixed-size chunks and streams them to the first client that connects.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stream_relay::{AudioSource, CapturePipeline, EncoderConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), stream_relay::StreamRelayError> {
//! let pipeline = CapturePipeline::builder()
//!     .source(AudioSource::loopback())
//!     .encoder(EncoderConfig::oggenc())
//!     .port(7777)
//!     .on_event(|e| tracing::info!(?e, "relay event"))
//!     .build()?;
//!
//! // Listens on port 7777; capture begins when a client connects
//! pipeline.start().await?;
//!
//! tokio::signal::ctrl_c().await.ok();
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The crate maintains a strict thread boundary:
//!
//! - **CPAL Thread**: Owns the stream; its callback only pushes into a ring buffer
//! - **Ring Buffer**: Lock-free SPSC queue absorbs scheduling jitter
//! - **Tokio Runtime**: Capture bridge, encoder output reader and relay tasks
//!
//! The building blocks are usable on their own: [`ChunkAccumulator`] re-segments any
//! `AsyncRead`, and [`SingleClientRelay`] forwards chunks to a single TCP client.

// unsafe_code lint is configured in Cargo.toml as "deny"
#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod accumulator;
mod builder;
mod chunk;
mod config;
mod encoder;
mod error;
mod event;
pub mod format;
mod pipeline;
mod relay;
mod session;
pub mod source;

pub use accumulator::{AccumulatorStats, ChunkAccumulator, ChunkCallback};
pub use builder::CapturePipelineBuilder;
pub use chunk::Chunk;
pub use config::{PcmFormat, PipelineConfig, RelayConfig, DEFAULT_CHUNK_SIZE, DEFAULT_PORT};
pub use encoder::{EncoderConfig, EncoderProcess};
pub use error::{StreamRelayError, TransportError};
pub use event::{event_callback, EventCallback, PipelineEvent};
pub use pipeline::CapturePipeline;
pub use relay::{RelayHandle, RelayState, RelayStats, SingleClientRelay, WriteOutcome};
pub use session::SessionStats;
pub use source::{AudioSource, CaptureSource};
