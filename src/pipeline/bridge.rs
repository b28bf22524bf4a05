//! Capture bridge task - drains the sample ring buffer into the encoder's standard input.
//!
//! Responsibilities:
//! - Polling the ring buffer at a fixed interval
//! - Converting samples to the encoder's input layout
//! - Writing the bytes to the encoder, in capture order
//! - Reporting samples the capture callback had to drop
//! - Draining what is left and closing the encoder input on shutdown

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ringbuf::traits::{Consumer, Observer};
use ringbuf::HeapCons;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;

use crate::event::{emit, EventCallback, PipelineEvent};
use crate::format::SampleConverter;
use crate::session::SessionState;
use crate::source::CaptureSource;

/// Samples moved out of the ring buffer per pop.
const SCRATCH_SAMPLES: usize = 8192;

/// Moves captured audio from the ring buffer to the encoder.
pub(crate) struct CaptureBridge<W> {
    samples: HeapCons<f32>,
    scratch: Vec<f32>,
    bytes: Vec<u8>,
    converter: SampleConverter,
    /// `None` once the encoder input has been closed or failed.
    writer: Option<W>,
    source: Arc<dyn CaptureSource>,
    state: Arc<SessionState>,
    poll_interval: Duration,
    reported_drops: u64,
    event_callback: Option<EventCallback>,
}

impl<W> CaptureBridge<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        samples: HeapCons<f32>,
        converter: SampleConverter,
        writer: W,
        source: Arc<dyn CaptureSource>,
        state: Arc<SessionState>,
        poll_interval: Duration,
        event_callback: Option<EventCallback>,
    ) -> Self {
        tracing::info!(
            source = source.name(),
            from = ?converter.source(),
            to = ?converter.target(),
            "capture bridge created"
        );

        Self {
            samples,
            scratch: vec![0.0; SCRATCH_SAMPLES],
            bytes: Vec::new(),
            converter,
            writer: Some(writer),
            source,
            state,
            poll_interval,
            reported_drops: 0,
            event_callback,
        }
    }

    /// Runs until the session stops, then drains the ring buffer and closes the encoder input.
    pub(crate) async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state.running.load(Ordering::SeqCst) {
            interval.tick().await;
            self.pump().await;
            self.report_overflow();
        }

        // Drain remaining audio on shutdown
        self.pump().await;
        self.report_overflow();
        self.close_input().await;
    }

    /// Moves everything currently buffered to the encoder.
    async fn pump(&mut self) {
        while !self.samples.is_empty() {
            let popped = self.samples.pop_slice(&mut self.scratch);
            if popped == 0 {
                break;
            }
            self.state
                .samples_captured
                .fetch_add(popped as u64, Ordering::Relaxed);

            // Encoder input is gone: keep draining so the callback never backs up
            if self.writer.is_none() {
                continue;
            }

            self.bytes.clear();
            self.converter
                .convert(&self.scratch[..popped], &mut self.bytes);
            self.write_bytes().await;
        }
    }

    async fn write_bytes(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if self.bytes.is_empty() {
            return;
        }

        match writer.write_all(&self.bytes).await {
            Ok(()) => {
                let total = self
                    .state
                    .bytes_to_encoder
                    .fetch_add(self.bytes.len() as u64, Ordering::Relaxed)
                    + self.bytes.len() as u64;
                tracing::trace!(bytes = self.bytes.len(), total, "wrote to encoder");
            }
            Err(e) => {
                tracing::warn!("encoder input closed: {e}");
                self.writer = None;
                emit(
                    self.event_callback.as_ref(),
                    PipelineEvent::EncoderInputClosed {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    fn report_overflow(&mut self) {
        let dropped = self.source.dropped_samples();
        if dropped <= self.reported_drops {
            return;
        }
        let delta = dropped - self.reported_drops;
        self.reported_drops = dropped;
        self.state.samples_dropped.store(dropped, Ordering::Relaxed);

        tracing::warn!(
            dropped_samples = delta,
            total = dropped,
            "capture ring buffer full, samples lost"
        );
        emit(
            self.event_callback.as_ref(),
            PipelineEvent::BufferOverflow {
                dropped_samples: delta,
            },
        );
    }

    /// Flushes and closes the encoder input, signalling end of audio.
    async fn close_input(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("closing encoder input: {e}");
            }
        }
        tracing::debug!(
            samples = self.state.samples_captured.load(Ordering::Relaxed),
            bytes = self.state.bytes_to_encoder.load(Ordering::Relaxed),
            "capture bridge finished"
        );
    }
}

/// Spawns the capture bridge as a background task.
pub(crate) fn spawn_capture_bridge<W>(bridge: CaptureBridge<W>) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(bridge.run())
}
