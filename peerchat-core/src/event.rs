//! Events exchanged between the network side and the presentation side.

use crate::post::ChatPost;

/// One bus event. Immutable once built; ownership moves to the bus on send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection to a peer was registered. Carries the peer's display id.
    PeerJoined(String),
    /// A connection to a peer was retired. Carries the peer's display id.
    PeerLeft(String),
    /// A post arrived from a peer.
    MessageReceived(ChatPost),
    /// A post authored locally, to broadcast to every peer.
    MessageToSend(ChatPost),
    /// Operational line for display.
    LogLine(String),
    /// Stop everything.
    Shutdown,
}

impl Event {
    /// Network-to-presentation events.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Event::PeerJoined(_) | Event::PeerLeft(_) | Event::MessageReceived(_) | Event::LogLine(_)
        )
    }
}
