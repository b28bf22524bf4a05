//! Mock audio source for testing without hardware.

use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Producer, Split};
use ringbuf::{HeapProd, HeapRb};

use super::{ring_capacity, CaptureSource, OpenedSource};
use crate::{PcmFormat, StreamRelayError};

/// A mock audio source that generates synthetic audio for testing.
///
/// This allows testing the full pipeline without requiring actual
/// audio hardware, making it suitable for CI environments.
///
/// # Example
///
/// ```
/// use stream_relay::source::MockSource;
///
/// let mut mock = MockSource::new(48_000, 2);
///
/// // Generate 100ms of silence
/// mock.generate_silence(100);
///
/// // Generate 100ms of a 440Hz sine wave
/// mock.generate_sine(440.0, 100);
///
/// assert_eq!(mock.samples().len(), 2 * 4800 * 2);
/// ```
#[derive(Debug, Clone)]
pub struct MockSource {
    format: PcmFormat,
    samples: Vec<f32>,
}

impl MockSource {
    /// Creates a new mock source with the given format.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: PcmFormat::new(sample_rate, channels),
            samples: Vec::new(),
        }
    }

    /// Returns the sample layout.
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Generates silence for the given duration in milliseconds.
    pub fn generate_silence(&mut self, duration_ms: u64) {
        let num_samples = self.samples_for_duration(duration_ms);
        self.samples.extend(std::iter::repeat(0.0).take(num_samples));
    }

    /// Generates a sine wave at the given frequency for the given duration.
    pub fn generate_sine(&mut self, frequency: f64, duration_ms: u64) {
        let channels = usize::from(self.format.channels.max(1));
        let num_frames = self.samples_for_duration(duration_ms) / channels;
        let sample_rate = f64::from(self.format.sample_rate);

        for i in 0..num_frames {
            let t = i as f64 / sample_rate;
            let value = (2.0 * std::f64::consts::PI * frequency * t).sin() as f32;

            // Write same sample to all channels
            self.samples.extend(std::iter::repeat(value).take(channels));
        }
    }

    /// Adds raw samples directly.
    pub fn add_samples(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    /// Returns the accumulated samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Returns the duration of accumulated samples.
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / usize::from(self.format.channels.max(1));
        Duration::from_secs_f64(frames as f64 / f64::from(self.format.sample_rate.max(1)))
    }

    /// Opens the mock like a device: paused, with a ring buffer.
    ///
    /// The ring buffer is always large enough to hold every generated sample.
    pub(crate) fn open(&self, buffer_duration: Duration) -> OpenedSource {
        let capacity = ring_capacity(self.format, buffer_duration).max(self.samples.len());
        let (producer, samples) = HeapRb::<f32>::new(capacity).split();

        OpenedSource {
            source: Box::new(MockCapture {
                format: self.format,
                pending: Mutex::new(Some((producer, self.samples.clone()))),
            }),
            samples,
        }
    }

    fn samples_for_duration(&self, duration_ms: u64) -> usize {
        let frames = (u64::from(self.format.sample_rate) * duration_ms / 1000) as usize;
        frames * usize::from(self.format.channels)
    }
}

/// An opened [`MockSource`].
///
/// The first `start()` delivers every generated sample at once; later starts deliver nothing.
pub struct MockCapture {
    format: PcmFormat,
    pending: Mutex<Option<(HeapProd<f32>, Vec<f32>)>>,
}

impl CaptureSource for MockCapture {
    fn name(&self) -> &str {
        "mock"
    }

    fn format(&self) -> PcmFormat {
        self.format
    }

    fn start(&self) -> Result<(), StreamRelayError> {
        if let Some((mut producer, samples)) = self.pending.lock().take() {
            let pushed = producer.push_slice(&samples);
            tracing::debug!(samples = pushed, "mock source delivered");
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), StreamRelayError> {
        Ok(())
    }
}
