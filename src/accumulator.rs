//! Re-segments an arbitrary byte stream into fixed-size chunks.
//!
//! The accumulator owns a single read loop. Each read asks for at most the bytes still
//! missing from the current chunk, so a chunk is emitted as soon as it fills and never
//! straddles two reads' worth of bookkeeping:
//!
//! ```text
//! reader ──read(buf[filled..])──▶ buffer ──full──▶ observers (in order) ──▶ next read
//!                                   │
//!                                   └─ zero bytes / error ──▶ ended (partial data dropped)
//! ```
//!
//! Stopping bumps a run generation. An in-flight read is abandoned or, if it already
//! completed, its bytes are discarded; either way nothing is emitted afterwards.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::event::{emit, EventCallback, PipelineEvent};
use crate::{Chunk, StreamRelayError};

/// Observer invoked with every full chunk.
pub type ChunkCallback = Arc<dyn Fn(Chunk) + Send + Sync>;

/// Counters describing an accumulator's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    /// Full chunks handed to observers.
    pub chunks_emitted: u64,
    /// Bytes consumed from the reader (including discarded ones).
    pub bytes_read: u64,
    /// Bytes sitting in the partial chunk buffer.
    pub pending_bytes: usize,
}

/// Reader plus the partially filled chunk. Parked while no read loop runs.
struct StreamState<R> {
    reader: R,
    buffer: Vec<u8>,
    filled: usize,
    next_sequence: u64,
}

/// State shared with the read loop task.
struct Shared {
    active: AtomicBool,
    ended: AtomicBool,
    chunks_emitted: AtomicU64,
    bytes_read: AtomicU64,
    pending_bytes: AtomicUsize,
    observers: RwLock<Vec<ChunkCallback>>,
    event_callback: Option<EventCallback>,
}

/// Cuts the bytes of an [`AsyncRead`] into [`Chunk`]s of exactly `chunk_size` bytes.
///
/// Observers registered with [`on_chunk`](Self::on_chunk) run synchronously on the read
/// loop, in registration order, before the next read is issued, so they see chunks in
/// stream order. Keep them short: a slow observer stalls the reader.
///
/// Must be started from within a tokio runtime.
///
/// # Example
///
/// ```
/// use stream_relay::ChunkAccumulator;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), stream_relay::StreamRelayError> {
/// let reader: &[u8] = &[1, 2, 3, 4, 5, 6, 7];
/// let mut accumulator = ChunkAccumulator::new(reader, 4)?;
/// accumulator.on_chunk(|chunk| assert_eq!(chunk.as_bytes(), &[1, 2, 3, 4]));
///
/// accumulator.start();
/// accumulator.finished().await;
///
/// assert!(accumulator.has_ended());
/// assert_eq!(accumulator.stats().chunks_emitted, 1);
/// assert_eq!(accumulator.stats().pending_bytes, 3);
/// # Ok(())
/// # }
/// ```
pub struct ChunkAccumulator<R> {
    chunk_size: usize,
    shared: Arc<Shared>,
    run_tx: watch::Sender<u64>,
    parked: Option<StreamState<R>>,
    task: Option<JoinHandle<Option<StreamState<R>>>>,
}

impl<R> ChunkAccumulator<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wraps `reader`, cutting its output into `chunk_size`-byte chunks.
    ///
    /// # Errors
    ///
    /// Returns [`StreamRelayError::InvalidChunkSize`] if `chunk_size` is zero.
    pub fn new(reader: R, chunk_size: usize) -> Result<Self, StreamRelayError> {
        Self::build(reader, chunk_size, None)
    }

    /// Like [`new`](Self::new), reporting the end of the stream to `callback`.
    pub fn with_event_callback(
        reader: R,
        chunk_size: usize,
        callback: EventCallback,
    ) -> Result<Self, StreamRelayError> {
        Self::build(reader, chunk_size, Some(callback))
    }

    fn build(
        reader: R,
        chunk_size: usize,
        event_callback: Option<EventCallback>,
    ) -> Result<Self, StreamRelayError> {
        if chunk_size == 0 {
            return Err(StreamRelayError::InvalidChunkSize { size: chunk_size });
        }

        let (run_tx, _) = watch::channel(0u64);
        Ok(Self {
            chunk_size,
            shared: Arc::new(Shared {
                active: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                chunks_emitted: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                pending_bytes: AtomicUsize::new(0),
                observers: RwLock::new(Vec::new()),
                event_callback,
            }),
            run_tx,
            parked: Some(StreamState {
                reader,
                buffer: vec![0u8; chunk_size],
                filled: 0,
                next_sequence: 0,
            }),
            task: None,
        })
    }

    /// Registers an observer for full chunks.
    ///
    /// Observers added while the loop runs see every chunk emitted after registration.
    pub fn on_chunk<F>(&self, callback: F)
    where
        F: Fn(Chunk) + Send + Sync + 'static,
    {
        self.shared.observers.write().push(Arc::new(callback));
    }

    /// Returns the configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns `true` while the read loop is meant to keep reading.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Returns `true` once the reader reported end of stream or an error.
    pub fn has_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    /// Returns current counters.
    pub fn stats(&self) -> AccumulatorStats {
        AccumulatorStats {
            chunks_emitted: self.shared.chunks_emitted.load(Ordering::SeqCst),
            bytes_read: self.shared.bytes_read.load(Ordering::SeqCst),
            pending_bytes: self.shared.pending_bytes.load(Ordering::SeqCst),
        }
    }

    /// Starts the read loop.
    ///
    /// Does nothing if the loop is already active or the stream has ended. After a
    /// [`stop()`](Self::stop), starting again resumes with the partial chunk that was
    /// buffered at the time.
    pub fn start(&mut self) {
        if self.has_ended() || self.shared.active.swap(true, Ordering::SeqCst) {
            return;
        }

        let generation = *self.run_tx.borrow();
        let run_rx = self.run_tx.subscribe();
        let previous = self.task.take();
        let parked = self.parked.take();
        let shared = Arc::clone(&self.shared);
        let chunk_size = self.chunk_size;

        tracing::debug!(chunk_size, generation, "accumulator starting");

        self.task = Some(tokio::spawn(async move {
            // A stopped run may still own the reader; wait for it to hand it back.
            let state = match previous {
                Some(handle) => handle.await.ok().flatten(),
                None => parked,
            };
            let Some(state) = state else {
                shared.finish(0);
                return None;
            };
            read_loop(state, shared, run_rx, generation, chunk_size).await
        }));
    }

    /// Stops the read loop.
    ///
    /// A read that is in flight may still complete, but its bytes are discarded: no chunk is
    /// emitted and no further read is issued.
    pub fn stop(&mut self) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.run_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
        tracing::debug!("accumulator stopped");
    }

    /// Waits until the current read loop has exited, either because the stream ended or
    /// because [`stop()`](Self::stop) was called.
    pub async fn finished(&mut self) {
        if let Some(handle) = self.task.take() {
            match handle.await {
                Ok(state) => self.parked = state,
                Err(e) => {
                    tracing::warn!("accumulator read loop aborted: {e}");
                    self.shared.finish(0);
                }
            }
        }
    }

    /// Waits up to `timeout` for the stream to end on its own.
    ///
    /// Returns `true` if it ended. On timeout the read loop keeps running.
    pub async fn wait_for_end(&mut self, timeout: Duration) -> bool {
        let Some(mut handle) = self.task.take() else {
            return self.has_ended();
        };
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(state)) => self.parked = state,
            Ok(Err(e)) => {
                tracing::warn!("accumulator read loop aborted: {e}");
                self.shared.finish(0);
            }
            Err(_) => self.task = Some(handle),
        }
        self.has_ended()
    }
}

impl Shared {
    /// Marks the stream as ended.
    fn finish(&self, discarded: usize) {
        self.ended.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.pending_bytes.store(discarded, Ordering::SeqCst);
    }

    fn emit_chunk(&self, chunk: &Chunk) {
        // Snapshot so observers may register further observers without deadlocking.
        let observers = self.observers.read().clone();
        for observer in &observers {
            observer(chunk.clone());
        }
        let emitted = self.chunks_emitted.fetch_add(1, Ordering::SeqCst) + 1;
        if emitted % 100 == 0 {
            tracing::debug!(
                chunks = emitted,
                bytes = self.bytes_read.load(Ordering::SeqCst),
                "accumulator progress"
            );
        }
    }
}

/// Result of waiting on either a read or a stop request.
enum Step {
    Stopped,
    Read(std::io::Result<usize>),
}

async fn read_loop<R>(
    mut state: StreamState<R>,
    shared: Arc<Shared>,
    mut run_rx: watch::Receiver<u64>,
    generation: u64,
    chunk_size: usize,
) -> Option<StreamState<R>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let filled = state.filled;
        let step = tokio::select! {
            biased;
            _ = run_rx.changed() => Step::Stopped,
            result = state.reader.read(&mut state.buffer[filled..]) => Step::Read(result),
        };

        // Stopped while the read was in flight: drop whatever it produced.
        if *run_rx.borrow() != generation {
            return Some(state);
        }

        let bytes = match step {
            Step::Stopped => return Some(state),
            Step::Read(Ok(0)) => {
                end_of_stream(&shared, state.filled, None);
                return None;
            }
            Step::Read(Err(e)) => {
                end_of_stream(&shared, state.filled, Some(&e));
                return None;
            }
            Step::Read(Ok(n)) => n,
        };

        state.filled += bytes;
        shared.bytes_read.fetch_add(bytes as u64, Ordering::SeqCst);

        if state.filled == chunk_size {
            let data = std::mem::replace(&mut state.buffer, vec![0u8; chunk_size]);
            let chunk = Chunk::new(data, state.next_sequence);
            state.next_sequence += 1;
            state.filled = 0;
            shared.emit_chunk(&chunk);
        }
        shared.pending_bytes.store(state.filled, Ordering::SeqCst);
    }
}

fn end_of_stream(shared: &Shared, discarded: usize, error: Option<&std::io::Error>) {
    let chunks = shared.chunks_emitted.load(Ordering::SeqCst);
    match error {
        Some(e) => tracing::warn!(chunks, discarded, "read failed, treating as end of stream: {e}"),
        None => tracing::info!(chunks, discarded, "stream ended"),
    }
    shared.finish(discarded);
    emit(
        shared.event_callback.as_ref(),
        PipelineEvent::StreamEnded {
            chunks,
            discarded_bytes: discarded,
        },
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted reader used to control read sizes and completion timing.

    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, ReadBuf};

    /// One scripted outcome of `poll_read`.
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Complete the read with these bytes (truncated to the requested length).
        Data(Vec<u8>),
        /// Wake immediately and return `Pending` once, delaying the next step.
        Yield,
        /// Never complete.
        Hang,
        /// Fail the read.
        Fail,
    }

    /// Reader that replays a script; end of script is end of stream.
    pub struct ScriptedReader {
        steps: VecDeque<Step>,
        completed_reads: Arc<AtomicUsize>,
        requested: Arc<parking_lot::Mutex<Vec<usize>>>,
    }

    impl ScriptedReader {
        pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
            Self {
                steps: steps.into_iter().collect(),
                completed_reads: Arc::new(AtomicUsize::new(0)),
                requested: Arc::new(parking_lot::Mutex::new(Vec::new())),
            }
        }

        /// Counter of reads that returned `Ready`.
        pub fn completed_reads(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.completed_reads)
        }

        /// Buffer lengths requested by each completed read.
        pub fn requested(&self) -> Arc<parking_lot::Mutex<Vec<usize>>> {
            Arc::clone(&self.requested)
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let step = self.steps.pop_front();
            let outcome = match step {
                Some(Step::Data(mut bytes)) => {
                    let room = buf.remaining();
                    if bytes.len() > room {
                        let rest = bytes.split_off(room);
                        self.steps.push_front(Step::Data(rest));
                    }
                    buf.put_slice(&bytes);
                    Poll::Ready(Ok(()))
                }
                Some(Step::Yield) => {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Some(Step::Hang) => {
                    self.steps.push_front(Step::Hang);
                    return Poll::Pending;
                }
                Some(Step::Fail) => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "scripted failure",
                ))),
                None => Poll::Ready(Ok(())),
            };
            self.requested.lock().push(buf.capacity());
            self.completed_reads.fetch_add(1, Ordering::SeqCst);
            outcome
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ScriptedReader, Step};
    use super::*;
    use parking_lot::Mutex;

    fn collect(accumulator: &ChunkAccumulator<ScriptedReader>) -> Arc<Mutex<Vec<Chunk>>> {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        accumulator.on_chunk(move |chunk| sink.lock().push(chunk));
        chunks
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let result = ChunkAccumulator::new(ScriptedReader::new([]), 0);
        assert!(matches!(
            result,
            Err(StreamRelayError::InvalidChunkSize { size: 0 })
        ));
    }

    #[tokio::test]
    async fn test_two_reads_emit_one_chunk() {
        let reader = ScriptedReader::new([Step::Data(vec![1, 2, 3]), Step::Data(vec![4, 5, 6, 7])]);
        let mut accumulator = ChunkAccumulator::new(reader, 4).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        accumulator.finished().await;

        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_bytes(), &[1, 2, 3, 4]);
        // 5, 6, 7 stay buffered and are never flushed
        assert_eq!(accumulator.stats().pending_bytes, 3);
        assert_eq!(accumulator.stats().bytes_read, 7);
        assert!(accumulator.has_ended());
        assert!(!accumulator.is_active());
    }

    #[tokio::test]
    async fn test_read_never_exceeds_remaining_capacity() {
        let reader = ScriptedReader::new([Step::Data(vec![1, 2, 3]), Step::Data(vec![4, 5, 6, 7])]);
        let requested = reader.requested();
        let mut accumulator = ChunkAccumulator::new(reader, 4).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        accumulator.finished().await;

        // 4 free, then 1 (the other 3 bytes wait for the next read), then 4, then 1 at EOF
        assert_eq!(*requested.lock(), vec![4, 1, 4, 1]);
        assert_eq!(chunks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_short_first_read_emits_nothing() {
        let reader = ScriptedReader::new([Step::Data(vec![9, 9]), Step::Hang]);
        let mut accumulator = ChunkAccumulator::new(reader, 4).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        wait_until(|| accumulator.stats().pending_bytes == 2).await;

        assert!(chunks.lock().is_empty());
        assert!(accumulator.is_active());
        accumulator.stop();
        accumulator.finished().await;
    }

    #[tokio::test]
    async fn test_stop_mid_chunk_emits_nothing_and_stops_reading() {
        let reader = ScriptedReader::new([Step::Data(vec![1, 2]), Step::Hang, Step::Data(vec![3, 4])]);
        let reads = reader.completed_reads();
        let mut accumulator = ChunkAccumulator::new(reader, 4).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        wait_until(|| accumulator.stats().pending_bytes == 2).await;

        accumulator.stop();
        accumulator.finished().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(chunks.lock().is_empty());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert!(!accumulator.is_active());
        assert!(!accumulator.has_ended());
    }

    #[tokio::test]
    async fn test_double_start_runs_single_loop() {
        let data: Vec<u8> = (0..64).collect();
        let reader = ScriptedReader::new(
            data.chunks(3)
                .flat_map(|c| [Step::Yield, Step::Data(c.to_vec())])
                .collect::<Vec<_>>(),
        );
        let mut accumulator = ChunkAccumulator::new(reader, 8).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        accumulator.start();
        accumulator.finished().await;

        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 8);
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.as_bytes().to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_chunk_count_is_floor_of_length() {
        for (len, size) in [(0usize, 4usize), (3, 4), (4, 4), (1000, 512), (1537, 512), (99, 7)] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let reader = ScriptedReader::new(
                data.chunks(5).map(|c| Step::Data(c.to_vec())).collect::<Vec<_>>(),
            );
            let mut accumulator = ChunkAccumulator::new(reader, size).unwrap();
            let chunks = collect(&accumulator);

            accumulator.start();
            accumulator.finished().await;

            let chunks = chunks.lock();
            assert_eq!(chunks.len(), len / size, "len={len} size={size}");
            assert!(chunks.iter().all(|c| c.len() == size));
            assert_eq!(accumulator.stats().pending_bytes, len % size);
        }
    }

    #[tokio::test]
    async fn test_chunks_preserve_stream_order_with_irregular_timing() {
        let data: Vec<u8> = (0..=255).collect();
        let mut steps = Vec::new();
        let mut offset = 0;
        let mut size = 1;
        while offset < data.len() {
            let end = (offset + size).min(data.len());
            for _ in 0..(size % 3) {
                steps.push(Step::Yield);
            }
            steps.push(Step::Data(data[offset..end].to_vec()));
            offset = end;
            size = size % 11 + 2;
        }
        let mut accumulator = ChunkAccumulator::new(ScriptedReader::new(steps), 16).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        accumulator.finished().await;

        let chunks = chunks.lock();
        assert_eq!(chunks.len(), 16);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u64);
            assert_eq!(chunk.as_bytes(), &data[i * 16..(i + 1) * 16]);
        }
    }

    #[tokio::test]
    async fn test_read_error_ends_stream_gracefully() {
        let reader = ScriptedReader::new([Step::Data(vec![1, 2, 3, 4, 5]), Step::Fail, Step::Data(vec![6, 7, 8])]);
        let reads = reader.completed_reads();
        let mut accumulator = ChunkAccumulator::new(reader, 4).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        accumulator.finished().await;

        assert_eq!(chunks.lock().len(), 1);
        assert!(accumulator.has_ended());
        // 4 bytes, 1 byte, then the failure; nothing after it
        assert_eq!(reads.load(Ordering::SeqCst), 3);

        // An ended stream cannot be restarted
        accumulator.start();
        assert!(!accumulator.is_active());
    }

    #[tokio::test]
    async fn test_restart_resumes_partial_chunk() {
        let reader = ScriptedReader::new([
            Step::Data(vec![1, 2]),
            Step::Hang,
        ]);
        let mut accumulator = ChunkAccumulator::new(reader, 4).unwrap();
        let chunks = collect(&accumulator);

        accumulator.start();
        wait_until(|| accumulator.stats().pending_bytes == 2).await;
        accumulator.stop();
        accumulator.start();
        assert!(accumulator.is_active());

        // Still hanging on the same reader; no chunk and the partial data is kept
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(chunks.lock().is_empty());
        assert_eq!(accumulator.stats().pending_bytes, 2);

        accumulator.stop();
        accumulator.finished().await;
    }

    #[tokio::test]
    async fn test_stream_end_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));

        let reader = ScriptedReader::new([Step::Data(vec![0; 10])]);
        let mut accumulator = ChunkAccumulator::with_event_callback(reader, 4, callback).unwrap();
        accumulator.start();
        accumulator.finished().await;

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            PipelineEvent::StreamEnded {
                chunks: 2,
                discarded_bytes: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_for_end() {
        let reader = ScriptedReader::new([Step::Data(vec![0; 4])]);
        let mut ending = ChunkAccumulator::new(reader, 4).unwrap();
        ending.start();
        assert!(ending.wait_for_end(Duration::from_secs(5)).await);
        assert_eq!(ending.stats().chunks_emitted, 1);

        let reader = ScriptedReader::new([Step::Hang]);
        let mut hanging = ChunkAccumulator::new(reader, 4).unwrap();
        hanging.start();
        assert!(!hanging.wait_for_end(Duration::from_millis(20)).await);
        assert!(hanging.is_active());
        hanging.stop();
        hanging.finished().await;
        assert!(!hanging.has_ended());
    }
}
