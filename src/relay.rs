//! Single-client TCP relay.
//!
//! The relay binds a listener, accepts exactly one connection and forwards chunks to it:
//!
//! ```text
//! write(chunk) ──send──▶ send queue ──▶ sender task ──write_all──▶ client
//!                                             liveness task ◀──read── client
//! ```
//!
//! - Writes never touch the socket; they only enqueue, so callers are never blocked by the
//!   network and bytes leave in the order `write` was called.
//! - The send queue is unbounded. Nothing written while the client is connected is ever
//!   dropped; a slow client grows the queue instead.
//! - The connection handle is set once and never replaced; after the first accept the
//!   listener is dropped.
//! - The liveness task reads and discards whatever the client sends so a disconnect is
//!   noticed even while nothing is being written.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::event::{emit, EventCallback, PipelineEvent};
use crate::{Chunk, RelayConfig, StreamRelayError, TransportError};

/// Listen backlog. Only one connection is ever accepted.
const LISTEN_BACKLOG: u32 = 1;

/// How long `close()` waits for queued chunks to drain before giving up on the client.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of a [`SingleClientRelay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayState {
    /// Waiting for the one client.
    Listening,
    /// The client is connected and receiving chunks.
    Connected {
        /// Address of the client.
        peer: SocketAddr,
    },
    /// The client went away. No replacement will be accepted.
    Disconnected {
        /// Address of the former client.
        peer: SocketAddr,
        /// What we observed.
        reason: String,
    },
    /// The relay was closed or its listener failed.
    Closed,
}

/// What happened to a chunk passed to [`SingleClientRelay::write()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Queued for the sender task.
    Queued,
    /// No client is connected (yet, or any more); the chunk was discarded.
    Dropped,
}

/// Counters describing relay traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Chunks fully written to the client socket.
    pub chunks_sent: u64,
    /// Bytes fully written to the client socket.
    pub bytes_sent: u64,
    /// Chunks discarded because no client was connected.
    pub chunks_dropped: u64,
    /// Chunks waiting in the send queue.
    pub chunks_queued: u64,
}

struct Shared {
    config: RelayConfig,
    state_tx: watch::Sender<RelayState>,
    client: OnceLock<mpsc::UnboundedSender<Chunk>>,
    peer: OnceLock<SocketAddr>,
    connected: AtomicBool,
    chunks_queued: AtomicU64,
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    chunks_dropped: AtomicU64,
    event_callback: Option<EventCallback>,
}

/// Forwards chunks to the first and only client that connects.
///
/// # Example
///
/// ```no_run
/// use stream_relay::{Chunk, RelayConfig, SingleClientRelay, WriteOutcome};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), stream_relay::StreamRelayError> {
/// let mut relay = SingleClientRelay::bind(RelayConfig::default(), None).await?;
///
/// // Nobody is connected yet: the chunk is silently dropped
/// assert_eq!(relay.write(Chunk::new(vec![0; 512], 0)), WriteOutcome::Dropped);
///
/// if let Some(peer) = relay.wait_for_client().await {
///     println!("streaming to {peer}");
///     relay.write(Chunk::new(vec![0; 512], 1));
/// }
/// relay.close().await;
/// # Ok(())
/// # }
/// ```
pub struct SingleClientRelay {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SingleClientRelay {
    /// Binds the listener and starts waiting for the client.
    ///
    /// # Errors
    ///
    /// Returns [`StreamRelayError::Bind`] if the address cannot be bound.
    pub async fn bind(
        config: RelayConfig,
        event_callback: Option<EventCallback>,
    ) -> Result<Self, StreamRelayError> {
        let addr = config.bind_addr;
        let listener = listen(addr).map_err(|source| StreamRelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StreamRelayError::Bind { addr, source })?;

        tracing::info!(%local_addr, "relay listening");

        let (state_tx, _) = watch::channel(RelayState::Listening);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            state_tx,
            client: OnceLock::new(),
            peer: OnceLock::new(),
            connected: AtomicBool::new(false),
            chunks_queued: AtomicU64::new(0),
            chunks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            event_callback,
        });

        let task = tokio::spawn(accept_once(listener, Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the current connection state.
    pub fn state(&self) -> RelayState {
        self.shared.state_tx.borrow().clone()
    }

    /// Returns `true` while a client is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Returns the client's address once one has connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer.get().copied()
    }

    /// Waits until the client connects.
    ///
    /// Returns `None` if the relay closed (or its listener failed) without a client.
    pub async fn wait_for_client(&self) -> Option<SocketAddr> {
        self.shared.wait_for_client().await
    }

    /// Hands a chunk to the client.
    ///
    /// Never blocks and never fails. While a client is connected every chunk is queued and
    /// eventually written; without one the chunk is dropped.
    pub fn write(&self, chunk: Chunk) -> WriteOutcome {
        self.shared.write(chunk)
    }

    /// Returns a cloneable handle that can write chunks from other tasks or callbacks.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns traffic counters.
    pub fn stats(&self) -> RelayStats {
        let shared = &self.shared;
        RelayStats {
            chunks_sent: shared.chunks_sent.load(Ordering::SeqCst),
            bytes_sent: shared.bytes_sent.load(Ordering::SeqCst),
            chunks_dropped: shared.chunks_dropped.load(Ordering::SeqCst),
            chunks_queued: shared.chunks_queued.load(Ordering::SeqCst),
        }
    }

    /// Closes the relay.
    ///
    /// Stops waiting for a client, lets already queued chunks reach the client, then shuts
    /// the connection down. Chunks written after this call are dropped.
    pub async fn close(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!("client not draining after {CLOSE_TIMEOUT:?}, abandoning queued chunks");
                task.abort();
            }
        }

        self.shared.state_tx.send_replace(RelayState::Closed);

        let stats = self.stats();
        tracing::info!(
            chunks_sent = stats.chunks_sent,
            bytes_sent = stats.bytes_sent,
            chunks_dropped = stats.chunks_dropped,
            chunks_abandoned = stats.chunks_queued,
            "relay closed"
        );
    }
}

impl Shared {
    async fn wait_for_client(&self) -> Option<SocketAddr> {
        let mut state_rx = self.state_tx.subscribe();
        // The sender lives in `self`, so this cannot fail while we hold a reference.
        let _ = state_rx
            .wait_for(|state| !matches!(state, RelayState::Listening))
            .await;
        self.peer.get().copied()
    }

    fn write(&self, chunk: Chunk) -> WriteOutcome {
        let Some(client) = self.client.get() else {
            self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            return WriteOutcome::Dropped;
        };
        if !self.connected.load(Ordering::SeqCst) {
            self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            return WriteOutcome::Dropped;
        }

        // Counted before sending so the sender task never sees the counter underflow
        self.chunks_queued.fetch_add(1, Ordering::SeqCst);
        if client.send(chunk).is_err() {
            self.chunks_queued.fetch_sub(1, Ordering::SeqCst);
            self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            return WriteOutcome::Dropped;
        }
        WriteOutcome::Queued
    }

    fn mark_disconnected(&self, peer: SocketAddr, reason: String) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(%peer, %reason, "client disconnected");
        self.state_tx.send_replace(RelayState::Disconnected {
            peer,
            reason: reason.clone(),
        });
        emit(
            self.event_callback.as_ref(),
            PipelineEvent::ClientDisconnected { peer, reason },
        );
    }

    /// Writes one chunk. Returns `false` once the connection is unusable.
    async fn send(&self, writer: &mut OwnedWriteHalf, chunk: &Chunk, peer: SocketAddr) -> bool {
        match writer.write_all(chunk.as_bytes()).await {
            Ok(()) => {
                self.chunks_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                true
            }
            Err(source) => {
                let error = TransportError::SendFailed { peer, source };
                if error.is_connection_lost() {
                    self.mark_disconnected(peer, error.to_string());
                    false
                } else {
                    tracing::warn!(sequence = chunk.sequence, "{error}");
                    emit(
                        self.event_callback.as_ref(),
                        PipelineEvent::SendFailed {
                            error: error.to_string(),
                        },
                    );
                    true
                }
            }
        }
    }
}

/// Cloneable writer half of a [`SingleClientRelay`].
///
/// Handles keep working after the relay is closed; their chunks are simply dropped.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl RelayHandle {
    /// Same as [`SingleClientRelay::write()`].
    pub fn write(&self, chunk: Chunk) -> WriteOutcome {
        self.shared.write(chunk)
    }

    /// Returns `true` while a client is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Same as [`SingleClientRelay::wait_for_client()`].
    pub async fn wait_for_client(&self) -> Option<SocketAddr> {
        self.shared.wait_for_client().await
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_once(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let accepted = tokio::select! {
        biased;
        _ = shutdown_rx.changed() => {
            tracing::debug!("relay closed before a client connected");
            shared.state_tx.send_replace(RelayState::Closed);
            return;
        }
        result = listener.accept() => result,
    };
    drop(listener);

    let (stream, peer) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            let error = TransportError::AcceptFailed(e);
            tracing::error!("{error}");
            shared.state_tx.send_replace(RelayState::Closed);
            emit(
                shared.event_callback.as_ref(),
                PipelineEvent::RelayFailed {
                    error: error.to_string(),
                },
            );
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, "could not disable Nagle: {e}");
    }
    let (reader, writer) = stream.into_split();
    let (client_tx, client_rx) = mpsc::unbounded_channel();

    // Set-once: the relay never hands out a second connection.
    let _ = shared.client.set(client_tx);
    let _ = shared.peer.set(peer);
    shared.connected.store(true, Ordering::SeqCst);
    shared
        .state_tx
        .send_replace(RelayState::Connected { peer });

    tracing::info!(%peer, "client connected");
    emit(
        shared.event_callback.as_ref(),
        PipelineEvent::ClientConnected { peer },
    );

    tokio::join!(
        send_loop(client_rx, writer, peer, &shared, shutdown_rx.clone()),
        liveness_loop(reader, peer, &shared, shutdown_rx),
    );
}

async fn send_loop(
    mut client_rx: mpsc::UnboundedReceiver<Chunk>,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
    shared: &Shared,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        // Queued chunks win over shutdown so close() drains them first.
        let chunk = tokio::select! {
            biased;
            chunk = client_rx.recv() => chunk,
            _ = shutdown_rx.changed() => None,
        };
        let Some(chunk) = chunk else { break };
        shared.chunks_queued.fetch_sub(1, Ordering::SeqCst);

        if !shared.send(&mut writer, &chunk, peer).await {
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(%peer, "socket shutdown failed: {e}");
    }
}

async fn liveness_loop(
    mut reader: OwnedReadHalf,
    peer: SocketAddr,
    shared: &Shared,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; shared.config.liveness_buffer_size.max(1)];
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            result = reader.read(&mut buffer) => result,
        };

        match result {
            Ok(0) => {
                // Half-close: the client is done sending but may still be receiving
                tracing::debug!(%peer, "client closed its sending side");
                return;
            }
            Ok(n) => tracing::trace!(%peer, bytes = n, "ignoring client payload"),
            Err(e) => {
                let error = TransportError::ConnectionLost {
                    peer,
                    reason: e.to_string(),
                };
                shared.mark_disconnected(peer, error.to_string());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use tokio::net::TcpStream;

    fn local_config() -> RelayConfig {
        RelayConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            ..Default::default()
        }
    }

    fn filled_chunk(byte: u8, sequence: u64) -> Chunk {
        Chunk::new(vec![byte; 512], sequence)
    }

    async fn wait_for_state(relay: &SingleClientRelay, matches: impl Fn(&RelayState) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches(&relay.state()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_without_client_is_noop() {
        let relay = SingleClientRelay::bind(local_config(), None).await.unwrap();

        for i in 0..10 {
            assert_eq!(relay.write(filled_chunk(0xAA, i)), WriteOutcome::Dropped);
        }
        assert_eq!(relay.state(), RelayState::Listening);
        assert_eq!(relay.stats().chunks_dropped, 10);
        assert_eq!(relay.stats().chunks_sent, 0);
    }

    #[tokio::test]
    async fn test_chunks_before_connect_never_reach_client() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        relay.write(filled_chunk(0xAA, 0));

        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let peer = relay.wait_for_client().await;
        assert_eq!(peer, Some(client.local_addr().unwrap()));

        assert_eq!(relay.write(filled_chunk(0xBB, 1)), WriteOutcome::Queued);
        relay.close().await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0xBB; 512]);
    }

    #[tokio::test]
    async fn test_rapid_writes_arrive_in_call_order() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        relay.wait_for_client().await.unwrap();

        let outcomes: Vec<_> = (1..=3u8)
            .map(|i| relay.write(filled_chunk(i, u64::from(i))))
            .collect();
        assert_eq!(outcomes, vec![WriteOutcome::Queued; 3]);

        let mut received = vec![0u8; 3 * 512];
        client.read_exact(&mut received).await.unwrap();
        assert!(received[..512].iter().all(|&b| b == 1));
        assert!(received[512..1024].iter().all(|&b| b == 2));
        assert!(received[1024..].iter().all(|&b| b == 3));

        relay.close().await;
        assert_eq!(relay.stats().chunks_sent, 3);
        assert_eq!(relay.stats().bytes_sent, 1536);
    }

    #[tokio::test]
    async fn test_accepts_only_one_client() {
        let relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let addr = relay.local_addr();
        let _first = TcpStream::connect(addr).await.unwrap();
        relay.wait_for_client().await.unwrap();

        // The listener is gone once the first client is accepted
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_client_disconnect_is_reported() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));

        let relay = SingleClientRelay::bind(local_config(), Some(callback))
            .await
            .unwrap();
        let client = TcpStream::connect(relay.local_addr()).await.unwrap();
        relay.wait_for_client().await.unwrap();
        assert!(relay.is_connected());

        drop(client);

        // A closed peer is noticed once sends start failing
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut sequence = 0;
            while relay.is_connected() {
                relay.write(filled_chunk(0xCC, sequence));
                sequence += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        wait_for_state(&relay, |state| {
            matches!(state, RelayState::Disconnected { .. })
        })
        .await;

        assert!(!relay.is_connected());
        assert_eq!(relay.write(filled_chunk(1, 0)), WriteOutcome::Dropped);

        let events = events.lock();
        assert!(matches!(events[0], PipelineEvent::ClientConnected { .. }));
        assert!(matches!(events[1], PipelineEvent::ClientDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_client_payload_is_ignored() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        relay.wait_for_client().await.unwrap();

        client.write_all(&[0u8; 10_000]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(relay.is_connected());

        relay.write(filled_chunk(7, 0));
        let mut received = vec![0u8; 512];
        client.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|&b| b == 7));
        relay.close().await;
    }

    #[tokio::test]
    async fn test_close_drains_queued_chunks() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        relay.wait_for_client().await.unwrap();

        for i in 0..50u8 {
            relay.write(filled_chunk(i, u64::from(i)));
        }
        relay.close().await;
        assert_eq!(relay.state(), RelayState::Closed);
        assert_eq!(relay.write(filled_chunk(0, 50)), WriteOutcome::Dropped);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 50 * 512);
        for (i, chunk) in received.chunks(512).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
    }

    #[tokio::test]
    async fn test_wait_for_client_after_close_without_client() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        relay.close().await;
        assert_eq!(relay.wait_for_client().await, None);
        assert_eq!(relay.state(), RelayState::Closed);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let config = RelayConfig {
            bind_addr: relay.local_addr(),
            ..Default::default()
        };
        let result = SingleClientRelay::bind(config, None).await;
        assert!(matches!(result, Err(StreamRelayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_burst_reaches_client_without_loss() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        relay.wait_for_client().await.unwrap();

        // Far more than the socket buffers hold while nobody reads
        for i in 0..1000u64 {
            assert_eq!(
                relay.write(filled_chunk((i % 251) as u8, i)),
                WriteOutcome::Queued
            );
        }

        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            client.read_to_end(&mut received).await.map(|_| received)
        });
        relay.close().await;

        let received = reader.await.unwrap().unwrap();
        assert_eq!(received.len(), 1000 * 512);
        for (i, chunk) in received.chunks(512).enumerate() {
            assert!(chunk.iter().all(|&b| b == (i % 251) as u8));
        }
        let stats = relay.stats();
        assert_eq!(stats.chunks_sent, 1000);
        assert_eq!(stats.chunks_queued, 0);
        assert_eq!(stats.chunks_dropped, 0);
    }

    #[tokio::test]
    async fn test_half_closed_client_keeps_receiving() {
        let mut relay = SingleClientRelay::bind(local_config(), None).await.unwrap();
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        relay.wait_for_client().await.unwrap();

        // Like `nc host port < /dev/null`: nothing more to send, still listening
        client.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(relay.is_connected());

        assert_eq!(relay.write(filled_chunk(9, 0)), WriteOutcome::Queued);
        relay.close().await;

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![9; 512]);
    }
}
