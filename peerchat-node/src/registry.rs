//! Peer stream registry: at most one open connection per peer, dial bookkeeping,
//! broadcast, and retirement of broken connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use peerchat_core::{ChatPost, Event, IgnoreSet, PeerId};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info};

use crate::bus::{EventSender, Shutdown};
use crate::pumps;
use crate::transport::{BoxedStream, InboundHandler, Transport};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE_WINDOW: Duration = Duration::from_secs(2);

type SharedWriter = Arc<Mutex<BufWriter<WriteHalf<BoxedStream>>>>;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Longest accepted frame, terminator included.
    pub max_line_len: usize,
    /// How long a failed dial keeps a peer ignored; `None` is forever.
    pub ignore_ttl: Option<Duration>,
    pub write_timeout: Duration,
    /// How long a freshly dialed stream that hits a clean EOF waits for the peer's own
    /// dial to replace it before being retired. Covers simultaneous dials.
    pub settle_window: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_line_len: 64 * 1024,
            ignore_ttl: None,
            write_timeout: WRITE_TIMEOUT,
            settle_window: SETTLE_WINDOW,
        }
    }
}

/// Which side opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Dialed,
    Accepted,
}

struct PeerConnection {
    generation: u64,
    origin: Origin,
    writer: SharedWriter,
    /// Dropped on retirement; the read pump watches the paired receiver.
    stop_reader: oneshot::Sender<()>,
}

impl PeerConnection {
    async fn close(self, timeout: Duration) {
        drop(self.stop_reader);
        let writer = self.writer;
        let _ = tokio::time::timeout(timeout, async move {
            let _ = writer.lock().await.shutdown().await;
        })
        .await;
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    local_id: PeerId,
    connections: Mutex<HashMap<PeerId, PeerConnection>>,
    dialing: Mutex<HashSet<PeerId>>,
    ignored: Mutex<IgnoreSet>,
    events: EventSender,
    outgoing: Mutex<Option<mpsc::UnboundedReceiver<ChatPost>>>,
    shutdown: Shutdown,
    next_generation: AtomicU64,
    options: RegistryOptions,
}

/// Cheap-to-clone handle on the process-wide registry.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<Inner>,
}

impl StreamRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: EventSender,
        outgoing: mpsc::UnboundedReceiver<ChatPost>,
        shutdown: Shutdown,
        options: RegistryOptions,
    ) -> Self {
        let local_id = transport.local_peer_id();
        Self {
            inner: Arc::new(Inner {
                transport,
                local_id,
                connections: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                ignored: Mutex::new(IgnoreSet::with_ttl(options.ignore_ttl)),
                events,
                outgoing: Mutex::new(Some(outgoing)),
                shutdown,
                next_generation: AtomicU64::new(1),
                options,
            }),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.inner.events
    }

    /// Dial `peer` unless it is connected, being dialed, ignored, or ourselves.
    /// A failed dial puts the peer in the ignore set. Returns whether a new connection was registered.
    pub async fn try_connect(&self, peer: PeerId) -> bool {
        if peer == self.inner.local_id || self.inner.shutdown.is_triggered() {
            return false;
        }
        // Claim the dial first; every later check runs with the claim held.
        if !self.inner.dialing.lock().await.insert(peer) {
            return false;
        }
        let registered = self.dial_claimed(peer).await;
        self.inner.dialing.lock().await.remove(&peer);
        registered
    }

    async fn dial_claimed(&self, peer: PeerId) -> bool {
        if self.inner.connections.lock().await.contains_key(&peer) {
            return false;
        }
        if self
            .inner
            .ignored
            .lock()
            .await
            .contains(&peer, Instant::now())
        {
            return false;
        }
        match self.inner.transport.open_stream(peer).await {
            Ok(stream) => self.register(peer, stream, Origin::Dialed).await,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dial failed; ignoring peer");
                self.inner.ignored.lock().await.insert(peer, Instant::now());
                false
            }
        }
    }

    /// Register an open stream for `peer`: store it, start its read pump, announce the join.
    /// The first registration also starts the outbound pump.
    async fn register(&self, peer: PeerId, stream: BoxedStream, origin: Origin) -> bool {
        if self.inner.shutdown.is_triggered() {
            return false;
        }
        let (read_half, write_half) = tokio::io::split(stream);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();
        let conn = PeerConnection {
            generation,
            origin,
            writer: Arc::new(Mutex::new(BufWriter::new(write_half))),
            stop_reader: stop_tx,
        };

        let replaced = {
            let mut map = self.inner.connections.lock().await;
            let keep = map
                .get(&peer)
                .is_some_and(|existing| self.keep_existing(peer, existing.origin, origin));
            if keep {
                debug!(peer = %peer, "duplicate stream; keeping existing");
                return false;
            }
            map.insert(peer, conn)
        };

        match replaced {
            Some(old) => {
                debug!(peer = %peer, "duplicate stream; replacing existing");
                old.close(self.close_timeout()).await;
            }
            None => {
                info!(peer = %peer, ?origin, "peer connected");
                self.inner.events.emit(Event::PeerJoined(peer.display_id()));
            }
        }

        let settle_until = (origin == Origin::Dialed)
            .then(|| tokio::time::Instant::now() + self.inner.options.settle_window);
        tokio::spawn(pumps::read_pump(
            self.clone(),
            peer,
            generation,
            BufReader::new(read_half),
            stop_rx,
            self.inner.shutdown.clone(),
            pumps::ReadLimits {
                max_line_len: self.inner.options.max_line_len,
                settle_until,
            },
        ));

        if let Some(outgoing) = self.inner.outgoing.lock().await.take() {
            tokio::spawn(pumps::outbound_pump(
                self.clone(),
                outgoing,
                self.inner.shutdown.clone(),
            ));
        }
        true
    }

    fn close_timeout(&self) -> Duration {
        self.inner.options.write_timeout.min(CLOSE_TIMEOUT)
    }

    /// Simultaneous dials: both sides keep the stream opened by the smaller peer id.
    fn keep_existing(&self, peer: PeerId, existing: Origin, incoming: Origin) -> bool {
        let dialer = |origin| match origin {
            Origin::Dialed => self.inner.local_id,
            Origin::Accepted => peer,
        };
        let (e, i) = (dialer(existing), dialer(incoming));
        e < i
    }

    /// Close and forget the connection to `peer`, announcing the departure. No-op if absent.
    pub async fn close_by_peer(&self, peer: PeerId) -> bool {
        self.retire(peer, None).await
    }

    /// Like `close_by_peer`, but only if the stored connection is still `generation`.
    pub(crate) async fn close_connection(&self, peer: PeerId, generation: u64) -> bool {
        self.retire(peer, Some(generation)).await
    }

    async fn retire(&self, peer: PeerId, generation: Option<u64>) -> bool {
        let removed = {
            let mut map = self.inner.connections.lock().await;
            let current = map
                .get(&peer)
                .is_some_and(|c| generation.map_or(true, |g| g == c.generation));
            if current {
                map.remove(&peer)
            } else {
                None
            }
        };
        let Some(conn) = removed else {
            return false;
        };
        conn.close(self.close_timeout()).await;
        info!(peer = %peer, "peer disconnected");
        self.inner.events.emit(Event::PeerLeft(peer.display_id()));
        true
    }

    /// Write `bytes` to every open connection at once. Connections that fail or stall past
    /// the write timeout are retired; the rest still get the frame. Returns how many
    /// connections took the write.
    pub async fn broadcast(&self, bytes: &[u8]) -> usize {
        let targets: Vec<(PeerId, u64, SharedWriter)> = {
            let map = self.inner.connections.lock().await;
            map.iter()
                .map(|(peer, c)| (*peer, c.generation, c.writer.clone()))
                .collect()
        };
        let writes = targets
            .into_iter()
            .map(|(peer, generation, writer)| async move {
                let write = async {
                    let mut w = writer.lock().await;
                    w.write_all(bytes).await?;
                    w.flush().await
                };
                match tokio::time::timeout(self.inner.options.write_timeout, write).await {
                    Ok(Ok(())) => return true,
                    Ok(Err(e)) => debug!(peer = %peer, error = %e, "write failed"),
                    Err(_) => debug!(peer = %peer, "write timed out"),
                }
                self.close_connection(peer, generation).await;
                false
            });
        join_all(writes).await.into_iter().filter(|ok| *ok).count()
    }

    /// Retire every connection. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<(PeerId, PeerConnection)> =
            self.inner.connections.lock().await.drain().collect();
        let timeout = self.close_timeout();
        for (peer, conn) in drained {
            conn.close(timeout).await;
            self.inner.events.emit(Event::PeerLeft(peer.display_id()));
        }
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.connections.lock().await.keys().copied().collect()
    }

    #[cfg(test)]
    pub async fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.connections.lock().await.contains_key(peer)
    }

    #[cfg(test)]
    pub async fn is_ignored(&self, peer: &PeerId) -> bool {
        self.inner
            .ignored
            .lock()
            .await
            .contains(peer, Instant::now())
    }
}

#[async_trait]
impl InboundHandler for StreamRegistry {
    async fn on_inbound_stream(&self, peer: PeerId, stream: BoxedStream) {
        if peer == self.inner.local_id {
            return;
        }
        self.register(peer, stream, Origin::Accepted).await;
    }
}
