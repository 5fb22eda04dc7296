//! Rendezvous discovery loop: advertise under the shared name, search for others doing the
//! same, dial what turns up; start over every search window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerchat_core::{FrameEncodeError, PeerId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventSender, Shutdown};
use crate::registry::StreamRegistry;

/// Wait before retrying a cycle whose advertise or search failed.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Live sequence of discovered peer ids. Dropping it abandons the search.
pub type PeerStream = mpsc::UnboundedReceiver<PeerId>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
}

/// The discovery network collaborator.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Best-effort contact with well-known nodes. Returns how many were usable.
    async fn bootstrap(&self) -> usize;

    async fn advertise(&self, rendezvous: &str) -> Result<(), DiscoveryError>;

    async fn find_peers(&self, rendezvous: &str) -> Result<PeerStream, DiscoveryError>;
}

/// Run until shutdown.
pub async fn run_discovery(
    discovery: Arc<dyn Discovery>,
    registry: StreamRegistry,
    rendezvous: String,
    window: Duration,
    events: EventSender,
    mut shutdown: Shutdown,
) {
    let reached = discovery.bootstrap().await;
    info!(reached, "bootstrap done");

    loop {
        if shutdown.is_triggered() {
            return;
        }
        events.log("Announcing ourselves...");
        if let Err(e) = discovery.advertise(&rendezvous).await {
            warn!(error = %e, "advertise failed");
            events.log(format!("Discovery failed: {}", e));
            if !pause(RETRY_DELAY, &mut shutdown).await {
                return;
            }
            continue;
        }

        events.log("Searching for other peers...");
        let mut found = match discovery.find_peers(&rendezvous).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "search failed");
                events.log(format!("Discovery failed: {}", e));
                if !pause(RETRY_DELAY, &mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        let deadline = Instant::now() + window;
        loop {
            let peer = tokio::select! {
                _ = shutdown.triggered() => return,
                _ = tokio::time::sleep_until(deadline) => break,
                peer = found.recv() => peer,
            };
            match peer {
                Some(peer) => consider(&registry, peer),
                None => {
                    // Search ran dry; sit out the rest of the window.
                    if !pause(deadline.saturating_duration_since(Instant::now()), &mut shutdown).await {
                        return;
                    }
                    break;
                }
            }
        }
        debug!("search window elapsed");
    }
}

fn consider(registry: &StreamRegistry, peer: PeerId) {
    if peer == registry.local_id() || peer.is_nil() {
        return;
    }
    let registry = registry.clone();
    tokio::spawn(async move {
        registry.try_connect(peer).await;
    });
}

/// Sleep unless shutdown comes first. Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = shutdown.triggered() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
