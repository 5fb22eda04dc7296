//! Two or more nodes on an in-memory network, driven by the real discovery loop.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use peerchat_core::{ChatPost, Event, PeerId};
use tokio::sync::mpsc;

use crate::bus::{self, EventSender, PresentationBus, Shutdown};
use crate::discovery::run_discovery;
use crate::registry::{RegistryOptions, StreamRegistry};
use crate::testing::{MemDiscovery, MemNetwork, MemTransport};

const RENDEZVOUS: &str = "TESTNET";

struct Node {
    id: PeerId,
    registry: StreamRegistry,
    presentation: PresentationBus,
    discovery: Arc<MemDiscovery>,
    events: EventSender,
    shutdown: Shutdown,
}

fn node(network: &Arc<MemNetwork>) -> Node {
    let (net, presentation) = bus::channel();
    let id = PeerId::random();
    let transport = Arc::new(MemTransport {
        local: id,
        network: network.clone(),
    });
    let registry = StreamRegistry::new(
        transport,
        net.events.clone(),
        net.outgoing,
        net.shutdown.clone(),
        RegistryOptions::default(),
    );
    network.join(&registry);
    Node {
        id,
        registry,
        presentation,
        discovery: Arc::new(MemDiscovery::new(id, network.clone())),
        events: net.events,
        shutdown: net.shutdown,
    }
}

impl Node {
    fn start_discovery(&self) {
        tokio::spawn(run_discovery(
            self.discovery.clone(),
            self.registry.clone(),
            RENDEZVOUS.into(),
            Duration::from_secs(20),
            self.events.clone(),
            self.shutdown.clone(),
        ));
    }

    async fn advertised(&self) {
        let discovery = self.discovery.clone();
        eventually(|| {
            let discovery = discovery.clone();
            async move { discovery.advertised.load(Ordering::SeqCst) > 0 }
        })
        .await;
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Next event that is not a log line. Generous enough to cover the settle window a
/// freshly dialed stream waits out before reporting its peer gone.
async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed");
        if !matches!(event, Event::LogLine(_)) {
            return event;
        }
    }
}

async fn no_more_events(rx: &mut mpsc::UnboundedReceiver<Event>) {
    let quiet = tokio::time::timeout(Duration::from_millis(200), next_event(rx)).await;
    if let Ok(event) = quiet {
        panic!("unexpected event: {:?}", event);
    }
}

/// A advertises first; B's search finds A and dials it.
async fn connected_pair(network: &Arc<MemNetwork>) -> (Node, Node) {
    let a = node(network);
    let b = node(network);
    a.start_discovery();
    a.advertised().await;
    b.start_discovery();

    let (ra, rb, ida, idb) = (a.registry.clone(), b.registry.clone(), a.id, b.id);
    eventually(|| {
        let (ra, rb) = (ra.clone(), rb.clone());
        async move { ra.is_connected(&idb).await && rb.is_connected(&ida).await }
    })
    .await;
    (a, b)
}

#[tokio::test]
async fn peers_meet_chat_and_part() {
    let network = Arc::new(MemNetwork::default());
    let (mut a, mut b) = connected_pair(&network).await;

    assert_eq!(
        next_event(&mut a.presentation.events).await,
        Event::PeerJoined(b.id.display_id())
    );
    assert_eq!(
        next_event(&mut b.presentation.events).await,
        Event::PeerJoined(a.id.display_id())
    );

    a.presentation
        .handle
        .send(Event::MessageToSend(ChatPost::new("alice", "hi")))
        .unwrap();
    assert_eq!(
        next_event(&mut b.presentation.events).await,
        Event::MessageReceived(ChatPost::new("alice", "hi"))
    );

    b.presentation
        .handle
        .send(Event::MessageToSend(ChatPost::new("bob", "hello back")))
        .unwrap();
    assert_eq!(
        next_event(&mut a.presentation.events).await,
        Event::MessageReceived(ChatPost::new("bob", "hello back"))
    );

    // A drops the connection; B notices exactly once.
    assert!(a.registry.close_by_peer(b.id).await);
    assert_eq!(
        next_event(&mut b.presentation.events).await,
        Event::PeerLeft(a.id.display_id())
    );
    no_more_events(&mut b.presentation.events).await;
    assert!(b.registry.peers().await.is_empty());
}

#[tokio::test]
async fn one_connection_per_pair() {
    let network = Arc::new(MemNetwork::default());
    let (a, b) = connected_pair(&network).await;

    // Rediscovery and a redundant dial from the other side change nothing.
    assert!(!b.registry.try_connect(a.id).await);
    a.registry.try_connect(b.id).await;
    assert_eq!(a.registry.peers().await, vec![b.id]);
    assert_eq!(b.registry.peers().await, vec![a.id]);
}

#[tokio::test]
async fn vanished_peer_is_ignored_after_failed_dial() {
    let network = Arc::new(MemNetwork::default());
    let ghost = node(&network);
    ghost.start_discovery();
    ghost.advertised().await;
    // Still advertised under the rendezvous name, but no longer reachable.
    network.leave(&ghost.id);

    let mut b = node(&network);
    b.start_discovery();
    let (rb, gid) = (b.registry.clone(), ghost.id);
    eventually(|| {
        let rb = rb.clone();
        async move { rb.is_ignored(&gid).await }
    })
    .await;
    assert!(!b.registry.is_connected(&ghost.id).await);
    assert!(!b.registry.try_connect(ghost.id).await);
    no_more_events(&mut b.presentation.events).await;
}
