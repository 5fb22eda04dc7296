//! Stream transport: the seams the registry dials and accepts through, plus the TCP
//! implementation with its fixed handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerchat_core::{PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bus::Shutdown;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PROTOCOL_ID_LEN: usize = u8::MAX as usize;

/// Any bidirectional byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Peer id to last known stream address. Written by discovery, read by dials.
pub type AddressBook = Arc<Mutex<HashMap<PeerId, SocketAddr>>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no known address for peer {0}")]
    UnknownPeer(PeerId),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("protocol mismatch: remote speaks {0:?}")]
    Protocol(String),
    #[error("dialed {expected} but {got} answered")]
    WrongPeer { expected: PeerId, got: PeerId },
    #[error("protocol id longer than 255 bytes")]
    ProtocolIdTooLong,
}

/// Outbound half of the transport collaborator.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream, TransportError>;
}

/// Receives every inbound stream once its remote identity is known.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_inbound_stream(&self, peer: PeerId, stream: BoxedStream);
}

/// TCP transport. Dials resolve through the shared address book.
pub struct TcpTransport {
    local_id: PeerId,
    protocol_id: String,
    addresses: AddressBook,
}

impl TcpTransport {
    pub fn new(local_id: PeerId, protocol_id: impl Into<String>, addresses: AddressBook) -> Self {
        Self {
            local_id,
            protocol_id: protocol_id.into(),
            addresses,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local_id
    }

    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream, TransportError> {
        let addr = self
            .addresses
            .lock()
            .await
            .get(&peer)
            .copied()
            .ok_or(TransportError::UnknownPeer(peer))?;
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        let remote = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake_connect(&mut stream, self.local_id, &self.protocol_id),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        if remote != peer {
            return Err(TransportError::WrongPeer {
                expected: peer,
                got: remote,
            });
        }
        debug!(peer = %peer, %addr, "stream opened");
        Ok(Box::new(stream))
    }
}

/// Accept loop: handshake each inbound TCP connection and hand it to `handler`.
pub async fn run_listener(
    listener: TcpListener,
    local_id: PeerId,
    protocol_id: String,
    handler: Arc<dyn InboundHandler>,
    mut shutdown: Shutdown,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => accepted,
        };
        let (mut stream, from) = match accepted {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let handler = handler.clone();
        let protocol_id = protocol_id.clone();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                handshake_accept(&mut stream, local_id, &protocol_id),
            )
            .await;
            match handshake {
                Ok(Ok(peer)) if peer == local_id => debug!(%from, "dropping connection to self"),
                Ok(Ok(peer)) => {
                    let _ = stream.set_nodelay(true);
                    info!(peer = %peer, %from, "inbound stream");
                    handler.on_inbound_stream(peer, Box::new(stream)).await;
                }
                Ok(Err(e)) => debug!(%from, error = %e, "inbound handshake failed"),
                Err(_) => debug!(%from, "inbound handshake timed out"),
            }
        });
    }
}

/// Dialer side: send our hello, then read theirs. Returns the remote peer id.
pub async fn handshake_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_id: PeerId,
    protocol_id: &str,
) -> Result<PeerId, TransportError> {
    stream.write_all(&hello_bytes(local_id, protocol_id)?).await?;
    stream.flush().await?;
    read_hello(stream, protocol_id).await
}

/// Listener side: read the dialer's hello, then answer with ours.
pub async fn handshake_accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    local_id: PeerId,
    protocol_id: &str,
) -> Result<PeerId, TransportError> {
    let peer = read_hello(stream, protocol_id).await?;
    stream.write_all(&hello_bytes(local_id, protocol_id)?).await?;
    stream.flush().await?;
    Ok(peer)
}

// version (1) + peer id (16) + protocol id length (1) + protocol id
fn hello_bytes(local_id: PeerId, protocol_id: &str) -> Result<Vec<u8>, TransportError> {
    if protocol_id.len() > MAX_PROTOCOL_ID_LEN {
        return Err(TransportError::ProtocolIdTooLong);
    }
    let mut out = Vec::with_capacity(18 + protocol_id.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(local_id.as_bytes());
    out.push(protocol_id.len() as u8);
    out.extend_from_slice(protocol_id.as_bytes());
    Ok(out)
}

async fn read_hello<R: AsyncRead + Unpin>(
    r: &mut R,
    protocol_id: &str,
) -> Result<PeerId, TransportError> {
    let mut head = [0u8; 18];
    r.read_exact(&mut head).await?;
    if head[0] != PROTOCOL_VERSION {
        return Err(TransportError::Version(head[0]));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&head[1..17]);
    let mut proto = vec![0u8; head[17] as usize];
    r.read_exact(&mut proto).await?;
    if proto != protocol_id.as_bytes() {
        return Err(TransportError::Protocol(
            String::from_utf8_lossy(&proto).into_owned(),
        ));
    }
    Ok(PeerId::from_bytes(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_exchanges_ids() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id_a = PeerId::random();
        let id_b = PeerId::random();
        let (ra, rb) = tokio::join!(
            handshake_connect(&mut a, id_a, "/chat/1"),
            handshake_accept(&mut b, id_b, "/chat/1"),
        );
        assert_eq!(ra.unwrap(), id_b);
        assert_eq!(rb.unwrap(), id_a);
    }

    #[tokio::test]
    async fn protocol_mismatch_fails_accept() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let id_a = PeerId::random();
        let accept = tokio::spawn(async move {
            handshake_accept(&mut b, PeerId::random(), "/chat/2").await
        });
        a.write_all(&hello_bytes(id_a, "/chat/1").unwrap())
            .await
            .unwrap();
        let err = accept.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::Protocol(p) if p == "/chat/1"));
    }

    #[tokio::test]
    async fn wrong_version_rejected() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut hello = hello_bytes(PeerId::random(), "/chat/1").unwrap();
        hello[0] = PROTOCOL_VERSION + 1;
        a.write_all(&hello).await.unwrap();
        let err = read_hello(&mut b, "/chat/1").await.unwrap_err();
        assert!(matches!(err, TransportError::Version(v) if v == PROTOCOL_VERSION + 1));
    }

    #[tokio::test]
    async fn unknown_peer_is_dial_error() {
        let book: AddressBook = Arc::new(Mutex::new(HashMap::new()));
        let transport = TcpTransport::new(PeerId::random(), "/chat/1", book);
        let peer = PeerId::random();
        let err = transport.open_stream(peer).await.err().unwrap();
        assert!(matches!(err, TransportError::UnknownPeer(p) if p == peer));
    }

    #[tokio::test]
    async fn tcp_dial_reaches_listener() {
        struct Capture(tokio::sync::mpsc::UnboundedSender<PeerId>);
        #[async_trait]
        impl InboundHandler for Capture {
            async fn on_inbound_stream(&self, peer: PeerId, _stream: BoxedStream) {
                let _ = self.0.send(peer);
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_id = PeerId::random();
        let client_id = PeerId::random();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let (net, _presentation) = crate::bus::channel();
        tokio::spawn(run_listener(
            listener,
            server_id,
            "/chat/1".into(),
            Arc::new(Capture(tx)),
            net.shutdown.clone(),
        ));

        let book: AddressBook = Arc::new(Mutex::new(HashMap::new()));
        book.lock().await.insert(server_id, addr);
        let transport = TcpTransport::new(client_id, "/chat/1", book);
        assert!(transport.open_stream(server_id).await.is_ok());
        assert_eq!(rx.recv().await, Some(client_id));
    }
}
