//! Discovery datagram protocol: message types, version and process-wide defaults.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current protocol version. Used in discovery datagrams and the stream handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Rendezvous name every node advertises under unless configured otherwise.
pub const DEFAULT_RENDEZVOUS: &str = "WOWMYSYPERSUBNET";

/// Stream protocol identifier checked during the handshake.
pub const DEFAULT_PROTOCOL_ID: &str = "/WOWMYSYPERSUBNET/0.0.1";

/// All discovery messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic advertisement under a rendezvous name.
    Beacon {
        protocol_version: u8,
        rendezvous: String,
        peer_id: PeerId,
        listen_port: u16,
    },
    /// Unicast reply to a beacon for a name the responder also advertises.
    Response {
        protocol_version: u8,
        rendezvous: String,
        peer_id: PeerId,
        listen_port: u16,
    },
}

impl Message {
    pub fn protocol_version(&self) -> u8 {
        match self {
            Message::Beacon {
                protocol_version, ..
            }
            | Message::Response {
                protocol_version, ..
            } => *protocol_version,
        }
    }

    pub fn rendezvous(&self) -> &str {
        match self {
            Message::Beacon { rendezvous, .. } | Message::Response { rendezvous, .. } => {
                rendezvous
            }
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            Message::Beacon { peer_id, .. } | Message::Response { peer_id, .. } => *peer_id,
        }
    }

    pub fn listen_port(&self) -> u16 {
        match self {
            Message::Beacon { listen_port, .. } | Message::Response { listen_port, .. } => {
                *listen_port
            }
        }
    }
}
