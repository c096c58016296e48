//! Orphan buffer: turns an unordered, causally incomplete event stream into a
//! parent-before-child release stream.
//!
//! # State
//!
//! - `orphans`: buffered events by hash, each with the set of parent
//!   descriptors it still waits on.
//! - `waiting`: missing parent descriptor to the orphans waiting on it.
//! - `released`: descriptors of non-ancient events already released.
//! - `orphans_by_round` / `missing_by_round`: round indexes used to prune on
//!   window advance without scanning everything. Both are cleaned lazily:
//!   entries may point at orphans that have since been released.
//!
//! # Invariants
//!
//! - An event is buffered iff it is not ancient and at least one parent is
//!   neither released nor ancient.
//! - No event is released twice.
//! - Within one call's output, every parent precedes its children.
//! - Cascades run on an explicit queue, so chain depth never grows the stack.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{debug, info, trace};

use crate::event::{EventDescriptor, EventHash, PlatformEvent, Round};
use crate::window::{EventWindow, WindowError};

/// Counters describing what the buffer has done with its input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanStats {
    pub released: u64,
    /// Re-submissions of an event already buffered or released.
    pub duplicates: u64,
    /// Events that were already ancient when submitted. Routine pruning.
    pub ancient_on_arrival: u64,
    /// Orphans that became ancient while still missing parents.
    pub unlinkable_discarded: u64,
}

#[derive(Debug)]
struct Orphan {
    event: PlatformEvent,
    missing: HashSet<EventDescriptor>,
}

/// Buffers events until their parents are known. Single-threaded by design.
#[derive(Debug, Default)]
pub struct OrphanBuffer {
    window: EventWindow,
    orphans: HashMap<EventHash, Orphan>,
    waiting: HashMap<EventDescriptor, Vec<EventHash>>,
    released: HashSet<EventDescriptor>,
    orphans_by_round: BTreeMap<Round, Vec<EventHash>>,
    missing_by_round: BTreeMap<Round, Vec<EventDescriptor>>,
    stats: OrphanStats,
}

impl OrphanBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer starting from a window other than genesis, e.g. after loading
    /// a saved state.
    #[must_use]
    pub fn with_window(window: EventWindow) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn event_window(&self) -> EventWindow {
        self.window
    }

    #[must_use]
    pub const fn stats(&self) -> OrphanStats {
        self.stats
    }

    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    #[must_use]
    pub fn is_buffered(&self, hash: &EventHash) -> bool {
        self.orphans.contains_key(hash)
    }

    #[must_use]
    pub fn is_released(&self, descriptor: &EventDescriptor) -> bool {
        self.released.contains(descriptor)
    }

    /// Submit a hashed event. Returns every event this submission released,
    /// parents first. Ancient events and re-submissions return nothing.
    pub fn submit(&mut self, event: PlatformEvent) -> Vec<PlatformEvent> {
        if self.window.is_ancient(event.birth_round()) {
            self.stats.ancient_on_arrival += 1;
            trace!(
                hash = %event.hash().short(),
                birth_round = event.birth_round(),
                ancient_threshold = self.window.ancient_threshold(),
                "dropping ancient event on arrival"
            );
            return Vec::new();
        }

        let descriptor = event.descriptor();
        if self.released.contains(&descriptor) || self.orphans.contains_key(&descriptor.hash) {
            self.stats.duplicates += 1;
            return Vec::new();
        }

        let missing: HashSet<EventDescriptor> = event
            .parents()
            .iter()
            .filter(|parent| !self.is_satisfied(parent))
            .copied()
            .collect();

        if missing.is_empty() {
            return self.release_cascade(event);
        }

        for parent in &missing {
            self.waiting.entry(*parent).or_default().push(descriptor.hash);
            self.missing_by_round
                .entry(parent.birth_round)
                .or_default()
                .push(*parent);
        }
        self.orphans_by_round
            .entry(descriptor.birth_round)
            .or_default()
            .push(descriptor.hash);
        self.orphans.insert(descriptor.hash, Orphan { event, missing });

        Vec::new()
    }

    /// Move to `window`. Orphans that became ancient are discarded; orphans
    /// whose missing parents became ancient are released, with cascades.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Regression`] if `window` would lower the
    /// ancient threshold. The buffer is unchanged in that case.
    pub fn advance_window(
        &mut self,
        window: EventWindow,
    ) -> Result<Vec<PlatformEvent>, WindowError> {
        self.window.check_advance(&window)?;
        self.window = window;
        let boundary = window.non_ancient_boundary();

        let kept = self.orphans_by_round.split_off(&boundary);
        let aged_out = std::mem::replace(&mut self.orphans_by_round, kept);
        for hash in aged_out.into_values().flatten() {
            let Some(orphan) = self.orphans.remove(&hash) else {
                continue;
            };
            self.stats.unlinkable_discarded += 1;
            info!(
                hash = %hash.short(),
                creator = %orphan.event.creator(),
                birth_round = orphan.event.birth_round(),
                missing_parents = orphan.missing.len(),
                ancient_threshold = window.ancient_threshold(),
                "discarding orphan that became ancient before its parents arrived"
            );
            for parent in &orphan.missing {
                self.forget_waiter(parent, &hash);
            }
        }

        let kept = self.missing_by_round.split_off(&boundary);
        let now_ancient = std::mem::replace(&mut self.missing_by_round, kept);
        let mut ready = Vec::new();
        for parent in now_ancient.into_values().flatten() {
            let Some(children) = self.waiting.remove(&parent) else {
                continue;
            };
            for child in children {
                if let Some(event) = self.resolve_parent(&child, &parent) {
                    ready.push(event);
                }
            }
        }

        let before = self.released.len();
        self.released
            .retain(|descriptor| !window.is_ancient(descriptor.birth_round));
        debug!(
            ancient_threshold = window.ancient_threshold(),
            pruned_released = before - self.released.len(),
            orphans = self.orphans.len(),
            "orphan buffer window advanced"
        );

        let mut out = Vec::new();
        for event in ready {
            out.extend(self.release_cascade(event));
        }
        Ok(out)
    }

    /// Drop all buffered and released state but keep the window. Used after
    /// a discontinuity, when the graph restarts from a new state.
    pub fn clear(&mut self) {
        self.orphans.clear();
        self.waiting.clear();
        self.released.clear();
        self.orphans_by_round.clear();
        self.missing_by_round.clear();
    }

    fn is_satisfied(&self, parent: &EventDescriptor) -> bool {
        self.window.is_ancient_descriptor(parent) || self.released.contains(parent)
    }

    /// Release `event` and every orphan that becomes complete as a result.
    fn release_cascade(&mut self, event: PlatformEvent) -> Vec<PlatformEvent> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            let descriptor = event.descriptor();
            self.released.insert(descriptor);
            self.stats.released += 1;

            if let Some(children) = self.waiting.remove(&descriptor) {
                for child in children {
                    if let Some(ready) = self.resolve_parent(&child, &descriptor) {
                        queue.push_back(ready);
                    }
                }
            }
            out.push(event);
        }

        out
    }

    /// Mark `parent` as no longer missing for orphan `child`. Returns the
    /// orphan if that was its last missing parent.
    fn resolve_parent(
        &mut self,
        child: &EventHash,
        parent: &EventDescriptor,
    ) -> Option<PlatformEvent> {
        let orphan = self.orphans.get_mut(child)?;
        orphan.missing.remove(parent);
        if !orphan.missing.is_empty() {
            return None;
        }
        self.orphans.remove(child).map(|orphan| orphan.event)
    }

    fn forget_waiter(&mut self, parent: &EventDescriptor, child: &EventHash) {
        if let Some(children) = self.waiting.get_mut(parent) {
            children.retain(|hash| hash != child);
            if children.is_empty() {
                self.waiting.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        EventCore, EventHasher, EventOrigin, GossipEvent, NodeId, PlatformEvent, Signature,
    };
    use chrono::{TimeZone, Utc};

    fn make(creator: u64, round: Round, parents: &[&PlatformEvent], nonce: u8) -> PlatformEvent {
        EventHasher::new().hash(
            GossipEvent::new(
                EventCore {
                    creator: NodeId(creator),
                    birth_round: round,
                    time_created: Utc.timestamp_opt(1_000, 0).single().expect("ts"),
                },
                parents.iter().map(|p| p.descriptor()).collect(),
                vec![vec![nonce]],
                Signature::default(),
            ),
            EventOrigin::Gossip,
        )
    }

    fn hashes(events: &[PlatformEvent]) -> Vec<EventHash> {
        events.iter().map(PlatformEvent::hash).collect()
    }

    fn window(ancient: Round) -> EventWindow {
        EventWindow::new(ancient + 1, ancient, 0).expect("window")
    }

    #[test]
    fn parentless_event_releases_immediately() {
        let mut buffer = OrphanBuffer::new();
        let a = make(0, 1, &[], 0);
        assert_eq!(hashes(&buffer.submit(a.clone())), vec![a.hash()]);
        assert_eq!(buffer.orphan_count(), 0);
    }

    #[test]
    fn children_wait_for_parent_then_release_after_it() {
        let mut buffer = OrphanBuffer::new();
        let a = make(0, 1, &[], 0);
        let b = make(1, 1, &[&a], 1);
        let c = make(2, 1, &[&a], 2);

        assert!(buffer.submit(b.clone()).is_empty());
        assert!(buffer.submit(c.clone()).is_empty());
        assert_eq!(buffer.orphan_count(), 2);

        let released = hashes(&buffer.submit(a.clone()));
        assert_eq!(released.len(), 3);
        assert_eq!(released[0], a.hash());
        assert!(released.contains(&b.hash()));
        assert!(released.contains(&c.hash()));
        assert_eq!(buffer.orphan_count(), 0);
    }

    #[test]
    fn deep_chain_cascades_in_order() {
        let mut buffer = OrphanBuffer::new();
        let root = make(0, 1, &[], 0);
        let mut chain = vec![root.clone()];
        for i in 1..5_000u32 {
            let prev = chain.last().expect("prev").clone();
            chain.push(make(0, 1, &[&prev], u8::try_from(i % 251).unwrap_or(0)));
        }

        for event in chain.iter().skip(1).rev() {
            assert!(buffer.submit(event.clone()).is_empty());
        }
        let released = buffer.submit(root);
        assert_eq!(hashes(&released), hashes(&chain));
    }

    #[test]
    fn ancient_event_is_dropped_and_not_retained() {
        let mut buffer = OrphanBuffer::with_window(window(5));
        let old = make(0, 5, &[], 0);
        assert!(buffer.submit(old.clone()).is_empty());
        assert_eq!(buffer.orphan_count(), 0);
        assert!(!buffer.is_released(&old.descriptor()));
        assert_eq!(buffer.stats().ancient_on_arrival, 1);
    }

    #[test]
    fn ancient_parent_is_vacuously_satisfied() {
        let mut buffer = OrphanBuffer::with_window(window(3));
        let never_seen = make(0, 2, &[], 0);
        let child = make(1, 4, &[&never_seen], 1);
        assert_eq!(hashes(&buffer.submit(child.clone())), vec![child.hash()]);
    }

    #[test]
    fn duplicate_submission_is_a_no_op() {
        let mut buffer = OrphanBuffer::new();
        let a = make(0, 1, &[], 0);
        let b = make(1, 1, &[&a], 1);

        assert!(buffer.submit(b.clone()).is_empty());
        assert!(buffer.submit(b.clone()).is_empty());
        assert_eq!(buffer.submit(a.clone()).len(), 2);
        assert!(buffer.submit(a).is_empty());
        assert!(buffer.submit(b).is_empty());
        assert_eq!(buffer.stats().duplicates, 3);
        assert_eq!(buffer.stats().released, 2);
    }

    #[test]
    fn orphan_aging_into_ancient_is_discarded() {
        let mut buffer = OrphanBuffer::new();
        let missing = make(0, 4, &[], 0);
        let d = make(1, 5, &[&missing], 1);

        assert!(buffer.submit(d.clone()).is_empty());
        let released = buffer.advance_window(window(5)).expect("advance");
        assert!(released.is_empty());
        assert!(!buffer.is_buffered(&d.hash()));
        assert_eq!(buffer.stats().unlinkable_discarded, 1);

        assert!(buffer.submit(missing).is_empty());
        assert_eq!(buffer.stats().ancient_on_arrival, 1);
    }

    #[test]
    fn parent_aging_out_releases_waiting_child_chain() {
        let mut buffer = OrphanBuffer::new();
        let lost = make(0, 3, &[], 0);
        let child = make(1, 5, &[&lost], 1);
        let grandchild = make(2, 6, &[&child], 2);

        assert!(buffer.submit(grandchild.clone()).is_empty());
        assert!(buffer.submit(child.clone()).is_empty());

        let released = buffer.advance_window(window(3)).expect("advance");
        assert_eq!(hashes(&released), vec![child.hash(), grandchild.hash()]);
        assert_eq!(buffer.orphan_count(), 0);
    }

    #[test]
    fn regression_is_rejected_without_side_effects() {
        let mut buffer = OrphanBuffer::with_window(window(6));
        let err = buffer.advance_window(window(4)).expect_err("regression");
        assert!(matches!(err, WindowError::Regression { current: 6, proposed: 4 }));
        assert_eq!(buffer.event_window().ancient_threshold(), 6);
    }

    #[test]
    fn released_set_is_pruned_on_advance() {
        let mut buffer = OrphanBuffer::new();
        let a = make(0, 2, &[], 0);
        buffer.submit(a.clone());
        assert!(buffer.is_released(&a.descriptor()));
        buffer.advance_window(window(2)).expect("advance");
        assert!(!buffer.is_released(&a.descriptor()));
    }

    #[test]
    fn clear_forgets_orphans_but_keeps_window() {
        let mut buffer = OrphanBuffer::with_window(window(2));
        let missing = make(0, 4, &[], 0);
        buffer.submit(make(1, 4, &[&missing], 1));
        buffer.clear();
        assert_eq!(buffer.orphan_count(), 0);
        assert_eq!(buffer.event_window().ancient_threshold(), 2);
    }
}
