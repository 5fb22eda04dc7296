//! Peers whose most recent dial failed. Consulted before every dial.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::PeerId;

/// Presence set of peer ids with an optional time-to-live.
///
/// With no TTL an entry is permanent for the life of the process. With a TTL, an entry
/// stops matching once it is older than the TTL and is dropped on the next lookup.
#[derive(Debug, Default)]
pub struct IgnoreSet {
    entries: HashMap<PeerId, Instant>,
    ttl: Option<Duration>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record a failed dial at `now`.
    pub fn insert(&mut self, peer: PeerId, now: Instant) {
        self.entries.insert(peer, now);
    }

    /// Whether `peer` should be skipped at `now`. Expired entries are removed.
    pub fn contains(&mut self, peer: &PeerId, now: Instant) -> bool {
        let Some(&since) = self.entries.get(peer) else {
            return false;
        };
        match self.ttl {
            Some(ttl) if now.saturating_duration_since(since) >= ttl => {
                self.entries.remove(peer);
                false
            }
            _ => true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
