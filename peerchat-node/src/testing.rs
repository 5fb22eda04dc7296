//! In-memory transport and discovery used by the unit tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use peerchat_core::{Event, PeerId};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use crate::discovery::{Discovery, DiscoveryError, PeerStream};
use crate::registry::StreamRegistry;
use crate::transport::{BoxedStream, InboundHandler, Transport, TransportError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Wait (briefly) for the next bus event.
pub async fn expect_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
}

/// Assert nothing arrives on the bus for a short while.
pub async fn expect_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Dials always succeed (unless marked unreachable) with one end of a duplex pipe;
/// the far end is kept for the test to read and write.
pub struct PipeTransport {
    local: PeerId,
    delay: Duration,
    unreachable: Mutex<HashSet<PeerId>>,
    far_ends: Mutex<HashMap<PeerId, DuplexStream>>,
    dials: Mutex<HashMap<PeerId, usize>>,
}

impl PipeTransport {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            local: PeerId::random(),
            delay,
            unreachable: Mutex::new(HashSet::new()),
            far_ends: Mutex::new(HashMap::new()),
            dials: Mutex::new(HashMap::new()),
        }
    }

    pub fn make_unreachable(&self, peer: PeerId) {
        self.unreachable.lock().unwrap().insert(peer);
    }

    pub fn make_reachable(&self, peer: PeerId) {
        self.unreachable.lock().unwrap().remove(&peer);
    }

    pub fn dial_count(&self, peer: &PeerId) -> usize {
        self.dials.lock().unwrap().get(peer).copied().unwrap_or(0)
    }

    pub fn take_far_end(&self, peer: &PeerId) -> Option<DuplexStream> {
        self.far_ends.lock().unwrap().remove(peer)
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream, TransportError> {
        *self.dials.lock().unwrap().entry(peer).or_insert(0) += 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unreachable.lock().unwrap().contains(&peer) {
            return Err(TransportError::Io(io::ErrorKind::ConnectionRefused.into()));
        }
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.far_ends.lock().unwrap().insert(peer, far);
        Ok(Box::new(near))
    }
}

/// Reads never complete; every write fails.
pub struct FailingStream;

impl AsyncRead for FailingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for FailingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Never makes progress: reads, writes and shutdown all stay pending.
pub struct PendingStream;

impl AsyncRead for PendingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for PendingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

/// A little network of registries joined by duplex pipes.
#[derive(Default)]
pub struct MemNetwork {
    nodes: Mutex<HashMap<PeerId, StreamRegistry>>,
    rendezvous: Mutex<HashMap<String, Vec<PeerId>>>,
}

impl MemNetwork {
    pub fn join(&self, registry: &StreamRegistry) {
        self.nodes
            .lock()
            .unwrap()
            .insert(registry.local_id(), registry.clone());
    }

    pub fn leave(&self, peer: &PeerId) {
        self.nodes.lock().unwrap().remove(peer);
    }
}

pub struct MemTransport {
    pub local: PeerId,
    pub network: Arc<MemNetwork>,
}

#[async_trait]
impl Transport for MemTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream, TransportError> {
        let target = self.network.nodes.lock().unwrap().get(&peer).cloned();
        let Some(target) = target else {
            return Err(TransportError::UnknownPeer(peer));
        };
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        target.on_inbound_stream(self.local, Box::new(far)).await;
        Ok(Box::new(near))
    }
}

/// Discovery over the same in-memory network. Searches report every peer advertised so far.
pub struct MemDiscovery {
    pub local: PeerId,
    pub network: Arc<MemNetwork>,
    pub advertised: AtomicUsize,
    pub searches: AtomicUsize,
    /// Number of upcoming `advertise` calls that fail.
    pub failures: AtomicUsize,
    /// Extra ids reported by every search, ahead of the advertised ones.
    pub extra: Mutex<Vec<PeerId>>,
}

impl MemDiscovery {
    pub fn new(local: PeerId, network: Arc<MemNetwork>) -> Self {
        Self {
            local,
            network,
            advertised: AtomicUsize::new(0),
            searches: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            extra: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Discovery for MemDiscovery {
    async fn bootstrap(&self) -> usize {
        0
    }

    async fn advertise(&self, rendezvous: &str) -> Result<(), DiscoveryError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DiscoveryError::Io(io::ErrorKind::NetworkUnreachable.into()));
        }
        self.advertised.fetch_add(1, Ordering::SeqCst);
        let mut table = self.network.rendezvous.lock().unwrap();
        let entry = table.entry(rendezvous.to_string()).or_default();
        if !entry.contains(&self.local) {
            entry.push(self.local);
        }
        Ok(())
    }

    async fn find_peers(&self, rendezvous: &str) -> Result<PeerStream, DiscoveryError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        for peer in self.extra.lock().unwrap().iter() {
            let _ = tx.send(*peer);
        }
        let table = self.network.rendezvous.lock().unwrap();
        for peer in table.get(rendezvous).into_iter().flatten() {
            let _ = tx.send(*peer);
        }
        Ok(rx)
    }
}
