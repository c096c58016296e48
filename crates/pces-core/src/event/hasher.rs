//! Canonical event hashing.
//!
//! The hash input is a fixed-width little-endian encoding of the immutable
//! fields, prefixed with a domain tag:
//!
//! ```text
//! "pces-event-v1"
//! creator:u64 birth_round:u64 secs:i64 nanos:u32
//! parent_count:u64 { hash:[u8;32] creator:u64 birth_round:u64 }*
//! tx_count:u64 { len:u64 bytes }*
//! ```
//!
//! Signature and origin are not hashed.

use super::{EventHash, EventOrigin, GossipEvent, PlatformEvent};

const DOMAIN: &[u8] = b"pces-event-v1";

/// Computes event hashes. Stateless; cheap to construct.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventHasher;

impl EventHasher {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hash the immutable fields of `event`.
    #[must_use]
    pub fn hash_of(&self, event: &GossipEvent) -> EventHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN);

        let core = &event.core;
        hasher.update(&core.creator.0.to_le_bytes());
        hasher.update(&core.birth_round.to_le_bytes());
        hasher.update(&core.time_created.timestamp().to_le_bytes());
        hasher.update(&core.time_created.timestamp_subsec_nanos().to_le_bytes());

        hasher.update(&(event.parents.len() as u64).to_le_bytes());
        for parent in &event.parents {
            hasher.update(parent.hash.as_bytes());
            hasher.update(&parent.creator.0.to_le_bytes());
            hasher.update(&parent.birth_round.to_le_bytes());
        }

        hasher.update(&(event.transactions.len() as u64).to_le_bytes());
        for tx in &event.transactions {
            hasher.update(&(tx.len() as u64).to_le_bytes());
            hasher.update(tx);
        }

        EventHash::from(hasher.finalize())
    }

    /// Hash `event` and freeze it as a [`PlatformEvent`].
    #[must_use]
    pub fn hash(&self, event: GossipEvent, origin: EventOrigin) -> PlatformEvent {
        let hash = self.hash_of(&event);
        PlatformEvent::from_parts(event, hash, origin)
    }
}
