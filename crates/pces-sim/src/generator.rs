//! Seeded hashgraph generation.
//!
//! Every node creates events in turn. Each event names its creator's
//! previous event as self-parent and the latest known event of a random
//! other node as other-parent, and is born in the highest parent round or
//! the one after. The output is in creation order, which is topological.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pces_core::event::{
    EventCore, EventHasher, EventOrigin, GossipEvent, NodeId, PlatformEvent, ROUND_FIRST, Round,
    Signature,
};

use crate::rng::DeterministicRng;

/// Shape of a generated graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Number of creating nodes.
    pub nodes: u64,
    /// Total number of events.
    pub events: usize,
    /// Chance that an event starts a new round (percent, 0–100).
    pub round_advance_percent: u8,
    /// Upper bound on transactions per event.
    pub max_transactions: u8,
    /// Base creation time, seconds since the epoch.
    pub base_secs: i64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            events: 200,
            round_advance_percent: 30,
            max_transactions: 3,
            base_secs: 1_708_012_200,
        }
    }
}

/// Build a graph for `config` from `rng`.
#[must_use]
pub fn generate(config: &GraphConfig, rng: &mut DeterministicRng) -> Vec<PlatformEvent> {
    let hasher = EventHasher::new();
    let nodes = config.nodes.max(2);
    let mut latest: Vec<Option<usize>> = vec![None; usize::try_from(nodes).unwrap_or(2)];
    let mut events: Vec<PlatformEvent> = Vec::with_capacity(config.events);

    for index in 0..config.events {
        let creator = rng.next_bounded(nodes);
        let other = (creator + 1 + rng.next_bounded(nodes - 1)) % nodes;

        let parents: Vec<&PlatformEvent> = [creator, other]
            .into_iter()
            .filter_map(|node| latest[slot(node)])
            .map(|position| &events[position])
            .collect();
        let parent_round = parents
            .iter()
            .map(|parent| parent.birth_round())
            .max()
            .unwrap_or(ROUND_FIRST);
        let round: Round = if rng.hit_rate_percent(config.round_advance_percent) {
            parent_round + 1
        } else {
            parent_round
        };

        let gossip = GossipEvent::new(
            EventCore {
                creator: NodeId(creator),
                birth_round: round,
                time_created: created_at(config.base_secs, index),
            },
            parents.iter().map(|parent| parent.descriptor()).collect(),
            transactions(rng, config.max_transactions, index),
            Signature(creator.to_le_bytes().to_vec()),
        );
        let event = hasher.hash(gossip, EventOrigin::Gossip);
        latest[slot(creator)] = Some(events.len());
        events.push(event);
    }
    events
}

#[allow(clippy::cast_possible_truncation)]
const fn slot(node: u64) -> usize {
    node as usize
}

fn created_at(base_secs: i64, index: usize) -> DateTime<Utc> {
    let offset = i64::try_from(index).unwrap_or(i64::MAX - base_secs);
    DateTime::from_timestamp(base_secs.saturating_add(offset), 0).unwrap_or_default()
}

/// One to `max` payloads, each non-empty and unique to the event.
fn transactions(rng: &mut DeterministicRng, max: u8, index: usize) -> Vec<Vec<u8>> {
    let count = 1 + rng.next_bounded(u64::from(max.max(1)));
    (0..count)
        .map(|tx| {
            let mut payload = (index as u64).to_le_bytes().to_vec();
            payload.push(u8::try_from(tx).unwrap_or(u8::MAX));
            payload
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn same_seed_same_graph() {
        let config = GraphConfig::default();
        let a = generate(&config, &mut DeterministicRng::new(5));
        let b = generate(&config, &mut DeterministicRng::new(5));
        assert_eq!(a, b);
        let c = generate(&config, &mut DeterministicRng::new(6));
        assert_ne!(a, c);
    }

    #[test]
    fn graph_is_topological_and_valid() {
        let config = GraphConfig {
            events: 300,
            ..GraphConfig::default()
        };
        let events = generate(&config, &mut DeterministicRng::new(9));
        assert_eq!(events.len(), 300);

        let mut seen = HashSet::new();
        for event in &events {
            let creators: HashSet<_> = event.parents().iter().map(|p| p.creator).collect();
            assert_eq!(creators.len(), event.parents().len());
            for parent in event.parents() {
                assert!(seen.contains(&parent.hash));
                assert!(parent.birth_round <= event.birth_round());
            }
            assert!(event.birth_round() >= ROUND_FIRST);
            seen.insert(event.hash());
        }
        assert_eq!(seen.len(), events.len());
    }
}
