#![allow(dead_code)]

use chrono::{DateTime, Utc};
use pces_core::event::{
    EventCore, EventHasher, EventOrigin, GossipEvent, NodeId, PlatformEvent, Round, Signature,
};
use proptest::prelude::*;

const BASE_SECS: i64 = 1_708_012_200;

/// One step of graph construction: who creates the event, which other
/// creator it gossips with, and whether it moves to the next round.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub creator: u64,
    pub other: u64,
    pub advance: bool,
    pub payload: u8,
}

pub fn timestamp(offset: usize) -> DateTime<Utc> {
    let secs = BASE_SECS + i64::try_from(offset).expect("offset fits");
    DateTime::from_timestamp(secs, 0).expect("valid timestamp")
}

pub fn gossip(
    creator: u64,
    round: Round,
    parents: &[&PlatformEvent],
    payload: u8,
    offset: usize,
) -> GossipEvent {
    GossipEvent::new(
        EventCore {
            creator: NodeId(creator),
            birth_round: round,
            time_created: timestamp(offset),
        },
        parents.iter().map(|parent| parent.descriptor()).collect(),
        vec![vec![payload, 0xAB]],
        Signature(vec![u8::try_from(creator % 256).expect("byte")]),
    )
}

/// Build a valid hashgraph in topological order. Every event has its
/// creator's previous event as self-parent and the latest event of another
/// creator as other-parent, so parents always come from distinct creators.
pub fn build_graph(steps: &[Step], creators: u64) -> Vec<PlatformEvent> {
    let hasher = EventHasher::new();
    let mut latest: Vec<Option<usize>> = vec![None; usize::try_from(creators).expect("fits")];
    let mut events: Vec<PlatformEvent> = Vec::with_capacity(steps.len());

    for (offset, step) in steps.iter().enumerate() {
        let creator = step.creator % creators;
        let other = (creator + 1 + step.other % (creators - 1).max(1)) % creators;
        let parents: Vec<&PlatformEvent> = [creator, other]
            .into_iter()
            .filter_map(|index| latest[usize::try_from(index).expect("fits")])
            .map(|position| &events[position])
            .collect();
        let parent_round = parents.iter().map(|p| p.birth_round()).max().unwrap_or(1);
        let round = if step.advance { parent_round + 1 } else { parent_round };
        let event = hasher.hash(
            gossip(creator, round, &parents, step.payload, offset),
            EventOrigin::Gossip,
        );
        latest[usize::try_from(creator).expect("fits")] = Some(events.len());
        events.push(event);
    }
    events
}

pub fn arb_step() -> impl Strategy<Value = Step> + Clone {
    (any::<u64>(), any::<u64>(), any::<bool>(), any::<u8>()).prop_map(
        |(creator, other, advance, payload)| Step {
            creator,
            other,
            advance,
            payload,
        },
    )
}

/// A valid graph of up to `max_len` events across 2..=5 creators.
pub fn arb_graph(max_len: usize) -> impl Strategy<Value = Vec<PlatformEvent>> {
    (2u64..=5, prop::collection::vec(arb_step(), 1..=max_len))
        .prop_map(|(creators, steps)| build_graph(&steps, creators))
}

/// A graph in topological order together with a shuffled delivery order.
pub fn arb_delivery(
    max_len: usize,
) -> impl Strategy<Value = (Vec<PlatformEvent>, Vec<PlatformEvent>)> {
    arb_graph(max_len).prop_flat_map(|graph| {
        let shuffled = Just(graph.clone()).prop_shuffle();
        (Just(graph), shuffled)
    })
}

/// A simple chain, one event per round, alternating between two creators.
pub fn chain(len: usize) -> Vec<PlatformEvent> {
    let steps: Vec<Step> = (0..len)
        .map(|i| Step {
            creator: u64::try_from(i % 2).expect("fits"),
            other: 0,
            advance: true,
            payload: u8::try_from(i % 256).expect("fits"),
        })
        .collect();
    build_graph(&steps, 2)
}
