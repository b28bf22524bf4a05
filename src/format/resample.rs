//! Sample rate conversion.
//!
//! Linear interpolation, fast and good enough to feed an encoder that resamples again anyway.
//! The resampler is streaming: it carries the last input frame and the fractional read
//! position between calls, so feeding audio in blocks produces the same output as feeding it
//! all at once.

/// Streaming linear resampler for interleaved f32 audio.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    /// Source frames advanced per output frame.
    step: f64,
    /// Read position in frames, relative to the start of `pending`.
    position: f64,
    /// Input frames not yet fully consumed (at most one between calls when upsampling).
    pending: Vec<f32>,
}

impl LinearResampler {
    /// Creates a resampler. Zero rates or channel counts are treated as 1.
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        let from_rate = from_rate.max(1);
        let to_rate = to_rate.max(1);
        Self {
            from_rate,
            to_rate,
            channels: usize::from(channels.max(1)),
            step: f64::from(from_rate) / f64::from(to_rate),
            position: 0.0,
            pending: Vec::new(),
        }
    }

    /// Returns `true` if input and output rates match.
    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resamples the next block of interleaved frames.
    ///
    /// A trailing partial frame is discarded.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let channels = self.channels;
        let whole = samples.len() - samples.len() % channels;
        if self.is_passthrough() {
            return samples[..whole].to_vec();
        }

        self.pending.extend_from_slice(&samples[..whole]);
        let frames = self.pending.len() / channels;

        let estimate = (whole / channels) as f64 / self.step;
        let mut output = Vec::with_capacity((estimate.ceil() as usize + 1) * channels);

        while self.position + 1.0 < frames as f64 {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = &self.pending[index * channels..(index + 1) * channels];
            let b = &self.pending[(index + 1) * channels..(index + 2) * channels];
            output.extend(a.iter().zip(b).map(|(&a, &b)| a + (b - a) * frac));
            self.position += self.step;
        }

        let consumed = (self.position.floor() as usize).min(frames);
        self.pending.drain(..consumed * channels);
        self.position -= consumed as f64;

        output
    }

    /// Forgets carried state, e.g. after a gap in the input.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.pending.clear();
    }
}
