//! LAN discovery network: UDP multicast beacons per rendezvous name, unicast replies,
//! optional unicast bootstrap endpoints. Sightings fill the transport's address book.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use peerchat_core::wire::{decode_frame, encode_frame};
use peerchat_core::{Message, PeerId, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::bus::Shutdown;
use crate::discovery::{Discovery, DiscoveryError, PeerStream};
use crate::transport::AddressBook;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);
const SIGHTINGS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Sighting {
    rendezvous: String,
    peer_id: PeerId,
}

struct KnownPeer {
    rendezvous: String,
    last_seen: Instant,
}

/// Discovery state, independent of the socket.
struct Directory {
    local_id: PeerId,
    transport_port: u16,
    advertised: Mutex<HashSet<String>>,
    known: Mutex<HashMap<PeerId, KnownPeer>>,
    addresses: AddressBook,
    sightings: broadcast::Sender<Sighting>,
}

impl Directory {
    fn new(local_id: PeerId, transport_port: u16, addresses: AddressBook) -> Self {
        let (sightings, _) = broadcast::channel(SIGHTINGS_CAPACITY);
        Self {
            local_id,
            transport_port,
            advertised: Mutex::new(HashSet::new()),
            known: Mutex::new(HashMap::new()),
            addresses,
            sightings,
        }
    }

    fn beacon(&self, rendezvous: &str) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            rendezvous: rendezvous.to_string(),
            peer_id: self.local_id,
            listen_port: self.transport_port,
        }
    }

    /// Record a datagram from `from`. Returns the reply to send back, if any.
    async fn observe(&self, msg: Message, from: SocketAddr) -> Option<Message> {
        if msg.protocol_version() != PROTOCOL_VERSION {
            return None;
        }
        let peer_id = msg.peer_id();
        if peer_id == self.local_id || peer_id.is_nil() {
            return None;
        }
        let rendezvous = msg.rendezvous().to_string();
        let stream_addr = SocketAddr::new(from.ip(), msg.listen_port());
        self.known.lock().await.insert(
            peer_id,
            KnownPeer {
                rendezvous: rendezvous.clone(),
                last_seen: Instant::now(),
            },
        );
        self.addresses.lock().await.insert(peer_id, stream_addr);
        trace!(peer = %peer_id, %stream_addr, %rendezvous, "sighting");
        let _ = self.sightings.send(Sighting {
            rendezvous: rendezvous.clone(),
            peer_id,
        });

        if !matches!(msg, Message::Beacon { .. })
            || !self.advertised.lock().await.contains(&rendezvous)
        {
            return None;
        }
        Some(Message::Response {
            protocol_version: PROTOCOL_VERSION,
            rendezvous,
            peer_id: self.local_id,
            listen_port: self.transport_port,
        })
    }

    /// Live search: peers already known under `rendezvous`, then every new sighting.
    async fn search(&self, rendezvous: &str) -> PeerStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut live = self.sightings.subscribe();
        let now = Instant::now();
        for (peer_id, known) in self.known.lock().await.iter() {
            if known.rendezvous == rendezvous
                && now.duration_since(known.last_seen) < PEER_TIMEOUT
            {
                let _ = tx.send(*peer_id);
            }
        }
        let rendezvous = rendezvous.to_string();
        tokio::spawn(async move {
            loop {
                let sighting = tokio::select! {
                    _ = tx.closed() => break,
                    sighting = live.recv() => sighting,
                };
                match sighting {
                    Ok(s) if s.rendezvous == rendezvous => {
                        if tx.send(s.peer_id).is_err() {
                            break;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Forget peers not heard from within the timeout.
    async fn expire(&self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = {
            let mut known = self.known.lock().await;
            let list: Vec<PeerId> = known
                .iter()
                .filter(|(_, k)| now.duration_since(k.last_seen) >= PEER_TIMEOUT)
                .map(|(id, _)| *id)
                .collect();
            for id in &list {
                known.remove(id);
            }
            list
        };
        if !expired.is_empty() {
            let mut addresses = self.addresses.lock().await;
            for id in &expired {
                addresses.remove(id);
            }
        }
        expired
    }
}

/// UDP beacon discovery. Background tasks stop on shutdown.
pub struct BeaconDiscovery {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    bootstrap_peers: Vec<String>,
    targets: Arc<Mutex<Vec<SocketAddr>>>,
    directory: Arc<Directory>,
}

impl BeaconDiscovery {
    pub async fn start(
        local_id: PeerId,
        discovery_port: u16,
        transport_port: u16,
        bootstrap_peers: Vec<String>,
        addresses: AddressBook,
        shutdown: Shutdown,
    ) -> std::io::Result<Self> {
        let socket = make_multicast_socket(discovery_port).await?;
        let group = SocketAddr::new(MULTICAST_GROUP.into(), discovery_port);
        let this = Self::new(
            socket,
            group,
            Directory::new(local_id, transport_port, addresses),
            bootstrap_peers,
        );

        tokio::spawn(beacon_loop(
            this.socket.clone(),
            this.group,
            this.targets.clone(),
            this.directory.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(recv_loop(
            this.socket.clone(),
            this.directory.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(peer_timeout_loop(this.directory.clone(), shutdown));
        Ok(this)
    }

    fn new(
        socket: UdpSocket,
        group: SocketAddr,
        directory: Directory,
        bootstrap_peers: Vec<String>,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            group,
            bootstrap_peers,
            targets: Arc::new(Mutex::new(Vec::new())),
            directory: Arc::new(directory),
        }
    }

    async fn send_beacon(&self, rendezvous: &str) -> Result<(), DiscoveryError> {
        let frame = encode_frame(&self.directory.beacon(rendezvous))?;
        self.socket.send_to(&frame, self.group).await?;
        for target in self.targets.lock().await.iter() {
            let _ = self.socket.send_to(&frame, target).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for BeaconDiscovery {
    async fn bootstrap(&self) -> usize {
        let mut resolved = Vec::new();
        for entry in &self.bootstrap_peers {
            match tokio::net::lookup_host(entry.as_str()).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        resolved.push(addr);
                    }
                }
                Err(e) => debug!(entry = %entry, error = %e, "bootstrap peer unresolvable"),
            }
        }
        let count = resolved.len();
        self.targets.lock().await.extend(resolved);
        count
    }

    async fn advertise(&self, rendezvous: &str) -> Result<(), DiscoveryError> {
        self.directory
            .advertised
            .lock()
            .await
            .insert(rendezvous.to_string());
        self.send_beacon(rendezvous).await
    }

    async fn find_peers(&self, rendezvous: &str) -> Result<PeerStream, DiscoveryError> {
        Ok(self.directory.search(rendezvous).await)
    }
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    targets: Arc<Mutex<Vec<SocketAddr>>>,
    directory: Arc<Directory>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => return,
            _ = tokio::time::sleep(BEACON_INTERVAL) => {}
        }
        let names: Vec<String> = directory.advertised.lock().await.iter().cloned().collect();
        let targets: Vec<SocketAddr> = targets.lock().await.clone();
        for name in names {
            let frame = match encode_frame(&directory.beacon(&name)) {
                Ok(f) => f,
                Err(e) => {
                    warn!(rendezvous = %name, error = %e, "cannot encode beacon");
                    continue;
                }
            };
            let _ = socket.send_to(&frame, group).await;
            for target in &targets {
                let _ = socket.send_to(&frame, target).await;
            }
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, directory: Arc<Directory>, mut shutdown: Shutdown) {
    let mut buf = vec![0u8; 65536];
    loop {
        let received = tokio::select! {
            _ = shutdown.triggered() => return,
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, from) = match received {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "discovery socket receive failed");
                continue;
            }
        };
        let msg = match decode_frame(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(%from, error = %e, "unreadable datagram");
                continue;
            }
        };
        if let Some(reply) = directory.observe(msg, from).await {
            if let Ok(frame) = encode_frame(&reply) {
                let _ = socket.send_to(&frame, from).await;
            }
        }
    }
}

async fn peer_timeout_loop(directory: Arc<Directory>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => return,
            _ = tokio::time::sleep(BEACON_INTERVAL) => {}
        }
        for peer in directory.expire(Instant::now()).await {
            debug!(peer = %peer, "discovery entry expired");
        }
    }
}
