//! Conversion of captured samples into the encoder's input layout.
//!
//! This module provides:
//! - Sample format conversion (i16/u16 → f32)
//! - Channel mapping (mono ↔ stereo, downmix, truncation)
//! - Streaming sample rate conversion
//! - Little-endian serialization for the encoder pipe

mod convert;
mod resample;

pub use convert::{i16_to_f32, remap_channels, u16_to_f32, write_f32_le};
pub use resample::LinearResampler;

use crate::PcmFormat;

/// Turns blocks of captured f32 samples into encoder-ready bytes.
///
/// # Example
///
/// ```
/// use stream_relay::format::SampleConverter;
/// use stream_relay::PcmFormat;
///
/// // Mono microphone feeding a stereo encoder at the same rate
/// let mut converter = SampleConverter::new(PcmFormat::new(48_000, 1), PcmFormat::STUDIO);
/// let mut bytes = Vec::new();
/// converter.convert(&[0.5, -0.5], &mut bytes);
/// assert_eq!(bytes.len(), 4 * 4); // two stereo frames of f32
/// ```
#[derive(Debug, Clone)]
pub struct SampleConverter {
    source: PcmFormat,
    target: PcmFormat,
    resampler: LinearResampler,
}

impl SampleConverter {
    /// Creates a converter from the capture format to the encoder format.
    pub fn new(source: PcmFormat, target: PcmFormat) -> Self {
        if source != target {
            tracing::debug!(?source, ?target, "converting captured audio");
        }
        Self {
            source,
            target,
            resampler: LinearResampler::new(source.sample_rate, target.sample_rate, target.channels),
        }
    }

    /// Format of the samples passed to [`convert()`](Self::convert).
    pub fn source(&self) -> PcmFormat {
        self.source
    }

    /// Format of the bytes produced.
    pub fn target(&self) -> PcmFormat {
        self.target
    }

    /// Converts one block and appends the little-endian bytes to `out`.
    ///
    /// Returns the number of bytes appended.
    pub fn convert(&mut self, samples: &[f32], out: &mut Vec<u8>) -> usize {
        let before = out.len();
        if self.source == self.target {
            write_f32_le(samples, out);
        } else {
            let mapped = remap_channels(samples, self.source.channels, self.target.channels);
            let resampled = self.resampler.process(&mapped);
            write_f32_le(&resampled, out);
        }
        out.len() - before
    }
}
