//! Peer identity: opaque 16-byte node id, hex text form, short display suffix.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of trailing hex characters shown as a peer's display id.
pub const DISPLAY_ID_LEN: usize = 6;

/// Peer ID: random per process, independent of network address. Used as the key
/// of every connection and in discovery datagrams.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Generate a fresh random peer id.
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// All-zero id. Never generated; treated as "no identity" by discovery.
    pub fn nil() -> Self {
        PeerId([0u8; 16])
    }

    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Short human-legible suffix of the id. Cosmetic only: never compare or look up by it.
    pub fn display_id(&self) -> String {
        let full = hex::encode(self.0);
        full[full.len() - DISPLAY_ID_LEN..].to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
