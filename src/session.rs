//! Relay session management.
//!
//! A [`Session`] owns everything one start-to-stop lifecycle acquires: the encoder process,
//! the opened capture source, the accumulator reading encoder output and the relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::process::ChildStdout;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::encoder::EncoderProcess;
use crate::event::{emit, EventCallback, PipelineEvent};
use crate::format::SampleConverter;
use crate::pipeline::{spawn_capture_bridge, CaptureBridge};
use crate::relay::RelayHandle;
use crate::source::{AudioSource, CaptureSource, OpenedSource};
use crate::{
    ChunkAccumulator, EncoderConfig, PipelineConfig, RelayConfig, SingleClientRelay,
    StreamRelayError,
};

/// Statistics about a relay session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Whether the capture source has been started (a client connected and start succeeded).
    pub capturing: bool,
    /// Samples taken from the capture ring buffer.
    pub samples_captured: u64,
    /// Samples lost because the ring buffer was full.
    pub samples_dropped: u64,
    /// Bytes written to the encoder's standard input.
    pub bytes_to_encoder: u64,
    /// Chunks cut from the encoder output.
    pub chunks_produced: u64,
    /// Chunks delivered to the client.
    pub chunks_sent: u64,
    /// Bytes delivered to the client.
    pub bytes_sent: u64,
    /// Chunks discarded because no client was connected.
    pub chunks_dropped: u64,
    /// Chunks waiting to be written to the client.
    pub chunks_queued: u64,
}

/// Internal state shared between the session and its background tasks.
pub(crate) struct SessionState {
    pub running: AtomicBool,
    pub capturing: AtomicBool,
    pub samples_captured: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub bytes_to_encoder: AtomicU64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            capturing: AtomicBool::new(false),
            samples_captured: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            bytes_to_encoder: AtomicU64::new(0),
        }
    }
}

/// Everything needed to start a session.
#[derive(Clone)]
pub(crate) struct SessionParams {
    pub source: AudioSource,
    pub encoder: EncoderConfig,
    pub relay: RelayConfig,
    pub pipeline: PipelineConfig,
    pub event_callback: Option<EventCallback>,
}

/// Resources of one running session.
pub(crate) struct Session {
    state: Arc<SessionState>,
    config: PipelineConfig,
    source: Arc<dyn CaptureSource>,
    encoder: Option<EncoderProcess>,
    accumulator: ChunkAccumulator<ChildStdout>,
    relay: SingleClientRelay,
    bridge: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    watcher_shutdown: watch::Sender<bool>,
}

impl Session {
    /// Acquires all resources and starts the background tasks.
    ///
    /// On failure everything acquired so far is released and the encoder is killed.
    pub(crate) async fn start(params: SessionParams) -> Result<Self, StreamRelayError> {
        let SessionParams {
            source,
            encoder: encoder_config,
            relay: relay_config,
            pipeline: config,
            event_callback,
        } = params;

        let mut encoder = EncoderProcess::spawn(&encoder_config)?;

        let OpenedSource { source, samples } =
            match open_source(source, config.ring_buffer_duration).await {
                Ok(opened) => opened,
                Err(e) => return rollback(encoder, e).await,
            };
        let source: Arc<dyn CaptureSource> = Arc::from(source);

        let pipes = encoder
            .take_stdin()
            .and_then(|stdin| Ok((stdin, encoder.take_stdout()?)));
        let (stdin, stdout) = match pipes {
            Ok(pipes) => pipes,
            Err(e) => return rollback(encoder, e).await,
        };

        let accumulator = match event_callback.clone() {
            Some(callback) => {
                ChunkAccumulator::with_event_callback(stdout, relay_config.chunk_size, callback)
            }
            None => ChunkAccumulator::new(stdout, relay_config.chunk_size),
        };
        let mut accumulator = match accumulator {
            Ok(accumulator) => accumulator,
            Err(e) => return rollback(encoder, e).await,
        };

        let relay = match SingleClientRelay::bind(relay_config, event_callback.clone()).await {
            Ok(relay) => relay,
            Err(e) => return rollback(encoder, e).await,
        };

        let state = Arc::new(SessionState::new());
        let (watcher_shutdown, shutdown_rx) = watch::channel(false);
        let watcher = spawn_watcher(
            relay.handle(),
            Arc::clone(&source),
            Arc::clone(&state),
            shutdown_rx,
            event_callback.clone(),
        );

        let converter = SampleConverter::new(source.format(), encoder_config.input);
        let bridge = spawn_capture_bridge(CaptureBridge::new(
            samples,
            converter,
            stdin,
            Arc::clone(&source),
            Arc::clone(&state),
            config.bridge_poll_interval,
            event_callback,
        ));

        let relay_handle = relay.handle();
        accumulator.on_chunk(move |chunk| {
            relay_handle.write(chunk);
        });
        accumulator.start();

        tracing::info!(
            source = source.name(),
            encoder = %encoder_config.program,
            relay = %relay.local_addr(),
            "session started, waiting for client"
        );

        Ok(Self {
            state,
            config,
            source,
            encoder: Some(encoder),
            accumulator,
            relay,
            bridge: Some(bridge),
            watcher: Some(watcher),
            watcher_shutdown,
        })
    }

    /// Returns the address the relay listens on.
    pub(crate) fn relay_addr(&self) -> SocketAddr {
        self.relay.local_addr()
    }

    /// Returns current session statistics.
    pub(crate) fn stats(&self) -> SessionStats {
        let relay = self.relay.stats();
        SessionStats {
            capturing: self.state.capturing.load(Ordering::SeqCst),
            samples_captured: self.state.samples_captured.load(Ordering::SeqCst),
            samples_dropped: self.state.samples_dropped.load(Ordering::SeqCst),
            bytes_to_encoder: self.state.bytes_to_encoder.load(Ordering::SeqCst),
            chunks_produced: self.accumulator.stats().chunks_emitted,
            chunks_sent: relay.chunks_sent,
            bytes_sent: relay.bytes_sent,
            chunks_dropped: relay.chunks_dropped,
            chunks_queued: relay.chunks_queued,
        }
    }

    /// Tears the session down in pipeline order.
    ///
    /// Every step runs even if an earlier one failed. The encoder's exit result is returned.
    pub(crate) async fn stop(mut self) -> Result<(), StreamRelayError> {
        tracing::info!("stopping session");

        // No capture start may race the stop below
        self.watcher_shutdown.send_replace(true);
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                tracing::warn!("connect watcher task failed: {e}");
            }
        }

        let source = Arc::clone(&self.source);
        match tokio::task::spawn_blocking(move || source.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to stop capture source: {e}"),
            Err(e) => tracing::warn!("capture stop task failed: {e}"),
        }
        self.state.capturing.store(false, Ordering::SeqCst);

        // Bridge drains the ring buffer, then closes encoder stdin
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(bridge) = self.bridge.take() {
            if let Err(e) = bridge.await {
                tracing::warn!("capture bridge task failed: {e}");
            }
        }

        if !self.accumulator.wait_for_end(self.config.drain_timeout).await {
            tracing::warn!(
                timeout = ?self.config.drain_timeout,
                "encoder output did not end, abandoning the rest"
            );
            self.accumulator.stop();
            self.accumulator.finished().await;
        }

        let result = match self.encoder.take() {
            Some(encoder) => encoder
                .finish(self.config.shutdown_timeout)
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        self.relay.close().await;

        let stats = self.stats();
        tracing::info!(
            samples_captured = stats.samples_captured,
            samples_dropped = stats.samples_dropped,
            chunks_produced = stats.chunks_produced,
            chunks_sent = stats.chunks_sent,
            "session stopped"
        );

        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.running.swap(false, Ordering::SeqCst) {
            // Dropped without stop(): tasks wind down, the encoder is killed on drop
            tracing::warn!("session dropped while running");
            self.watcher_shutdown.send_replace(true);
        }
    }
}

async fn open_source(
    source: AudioSource,
    buffer_duration: std::time::Duration,
) -> Result<OpenedSource, StreamRelayError> {
    tokio::task::spawn_blocking(move || source.open(buffer_duration))
        .await
        .map_err(|e| StreamRelayError::CaptureThread(e.to_string()))?
}

async fn rollback<T>(encoder: EncoderProcess, error: StreamRelayError) -> Result<T, StreamRelayError> {
    tracing::warn!("session start failed, rolling back: {error}");
    encoder.kill().await;
    Err(error)
}

/// Starts capture once the relay has its client.
fn spawn_watcher(
    relay: RelayHandle,
    source: Arc<dyn CaptureSource>,
    state: Arc<SessionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    event_callback: Option<EventCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let peer = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            peer = relay.wait_for_client() => peer,
        };
        let Some(peer) = peer else {
            return;
        };

        let name = source.name().to_string();
        let starting = Arc::clone(&source);
        let result = tokio::task::spawn_blocking(move || starting.start())
            .await
            .map_err(|e| StreamRelayError::CaptureThread(e.to_string()))
            .and_then(|started| started);

        match result {
            Ok(()) => {
                state.capturing.store(true, Ordering::SeqCst);
                tracing::info!(%peer, source = %name, "capture started");
                emit(
                    event_callback.as_ref(),
                    PipelineEvent::CaptureStarted { source: name },
                );
            }
            Err(e) => {
                tracing::error!(%peer, source = %name, "capture failed to start: {e}");
                emit(
                    event_callback.as_ref(),
                    PipelineEvent::CaptureFailed {
                        reason: e.to_string(),
                    },
                );
            }
        }
    })
}
