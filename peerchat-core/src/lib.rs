//! Peer-to-peer group chat: identity, post codec, bus events, ignore set, discovery protocol.
//! No I/O; the node crate drives sockets and tasks.

pub mod event;
pub mod identity;
pub mod ignore;
pub mod post;
pub mod protocol;
pub mod wire;

pub use event::Event;
pub use identity::{PeerId, DISPLAY_ID_LEN};
pub use ignore::IgnoreSet;
pub use post::{ChatPost, CodecError};
pub use protocol::{Message, DEFAULT_PROTOCOL_ID, DEFAULT_RENDEZVOUS, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
