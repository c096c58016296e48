//! Event data model for the hashgraph intake pipeline.
//!
//! An event is an immutable node of the causal graph. It arrives as a
//! [`GossipEvent`] (the unhashed wire and log form), is hashed by the
//! [`EventHasher`] into a [`PlatformEvent`], and from then on is identified by
//! its [`EventHash`]. Children name their parents with an [`EventDescriptor`],
//! which carries enough (hash, creator, birth round) to decide whether the
//! parent is still relevant without looking it up.
//!
//! The hash covers creator, parents, birth round, creation time and
//! transactions. It never covers the signature or the runtime-assigned
//! [`EventOrigin`].

pub mod codec;
pub mod hash;
pub mod hasher;
pub mod validate;

pub use codec::{CodecError, EventCodec};
pub use hash::{EventHash, HASH_LEN, ParseHashError};
pub use hasher::EventHasher;
pub use validate::{EventValidator, ValidationError};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consensus round number.
pub type Round = u64;

/// Placeholder round; never a valid birth round.
pub const ROUND_UNDEFINED: Round = 0;

/// First round any event can be born in.
pub const ROUND_FIRST: Round = 1;

/// Identifier of the node that created an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Reference to a specific event: enough to identify a parent without a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub hash: EventHash,
    pub creator: NodeId,
    pub birth_round: Round,
}

/// Creator-controlled metadata of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCore {
    pub creator: NodeId,
    pub birth_round: Round,
    pub time_created: DateTime<Utc>,
}

/// Opaque creator signature over the event hash.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// Where an event entered this node from. Never part of the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Received from a peer.
    Gossip,
    /// Created by this node.
    Runtime,
    /// Replayed from the durable event log.
    Storage,
    /// Rewritten and re-signed by an offline migration.
    Migration,
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gossip => "gossip",
            Self::Runtime => "runtime",
            Self::Storage => "storage",
            Self::Migration => "migration",
        })
    }
}

/// An event as it travels on the wire and in the log: not yet hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEvent {
    pub core: EventCore,
    pub parents: Vec<EventDescriptor>,
    pub transactions: Vec<Vec<u8>>,
    pub signature: Signature,
}

impl GossipEvent {
    #[must_use]
    pub const fn new(
        core: EventCore,
        parents: Vec<EventDescriptor>,
        transactions: Vec<Vec<u8>>,
        signature: Signature,
    ) -> Self {
        Self {
            core,
            parents,
            transactions,
            signature,
        }
    }

    #[must_use]
    pub const fn birth_round(&self) -> Round {
        self.core.birth_round
    }

    #[must_use]
    pub const fn creator(&self) -> NodeId {
        self.core.creator
    }

    /// Sum of transaction payload lengths.
    #[must_use]
    pub fn transaction_bytes(&self) -> usize {
        self.transactions.iter().map(Vec::len).sum()
    }
}

/// A hashed, immutable event.
///
/// Only [`EventHasher`] builds these, so the hash always matches the content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEvent {
    gossip: GossipEvent,
    hash: EventHash,
    origin: EventOrigin,
}

impl PlatformEvent {
    pub(crate) const fn from_parts(gossip: GossipEvent, hash: EventHash, origin: EventOrigin) -> Self {
        Self {
            gossip,
            hash,
            origin,
        }
    }

    #[must_use]
    pub const fn hash(&self) -> EventHash {
        self.hash
    }

    #[must_use]
    pub const fn descriptor(&self) -> EventDescriptor {
        EventDescriptor {
            hash: self.hash,
            creator: self.gossip.core.creator,
            birth_round: self.gossip.core.birth_round,
        }
    }

    #[must_use]
    pub const fn creator(&self) -> NodeId {
        self.gossip.core.creator
    }

    #[must_use]
    pub const fn birth_round(&self) -> Round {
        self.gossip.core.birth_round
    }

    #[must_use]
    pub const fn time_created(&self) -> DateTime<Utc> {
        self.gossip.core.time_created
    }

    #[must_use]
    pub fn parents(&self) -> &[EventDescriptor] {
        &self.gossip.parents
    }

    #[must_use]
    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.gossip.transactions
    }

    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.gossip.signature
    }

    #[must_use]
    pub const fn core(&self) -> &EventCore {
        &self.gossip.core
    }

    #[must_use]
    pub const fn origin(&self) -> EventOrigin {
        self.origin
    }

    #[must_use]
    pub const fn gossip(&self) -> &GossipEvent {
        &self.gossip
    }

    #[must_use]
    pub fn into_gossip(self) -> GossipEvent {
        self.gossip
    }

    /// Same event, tagged with a different origin. The hash is unchanged.
    #[must_use]
    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> GossipEvent {
        GossipEvent::new(
            EventCore {
                creator: NodeId(3),
                birth_round: 7,
                time_created: Utc.timestamp_opt(1_700_000_000, 5).single().expect("ts"),
            },
            Vec::new(),
            vec![b"abc".to_vec(), b"de".to_vec()],
            Signature(vec![1, 2, 3]),
        )
    }

    #[test]
    fn descriptor_mirrors_event_fields() {
        let event = EventHasher::new().hash(sample(), EventOrigin::Gossip);
        let desc = event.descriptor();
        assert_eq!(desc.hash, event.hash());
        assert_eq!(desc.creator, NodeId(3));
        assert_eq!(desc.birth_round, 7);
    }

    #[test]
    fn transaction_bytes_sums_payloads() {
        assert_eq!(sample().transaction_bytes(), 5);
    }

    #[test]
    fn with_origin_keeps_hash() {
        let event = EventHasher::new().hash(sample(), EventOrigin::Gossip);
        let hash = event.hash();
        let replayed = event.with_origin(EventOrigin::Storage);
        assert_eq!(replayed.hash(), hash);
        assert_eq!(replayed.origin(), EventOrigin::Storage);
    }

    #[test]
    fn signature_debug_hides_bytes() {
        assert_eq!(format!("{:?}", Signature(vec![0; 64])), "Signature(64 bytes)");
    }
}
