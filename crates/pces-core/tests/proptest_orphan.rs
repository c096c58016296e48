use std::collections::{HashMap, HashSet};

use pces_core::event::{EventHash, PlatformEvent};
use pces_core::orphan::OrphanBuffer;
use pces_core::window::EventWindow;
use proptest::prelude::*;

#[path = "generators.rs"]
mod generators;
use generators::*;

fn deliver(buffer: &mut OrphanBuffer, events: &[PlatformEvent]) -> Vec<PlatformEvent> {
    events
        .iter()
        .flat_map(|event| buffer.submit(event.clone()))
        .collect()
}

fn hashes(events: &[PlatformEvent]) -> HashSet<EventHash> {
    events.iter().map(PlatformEvent::hash).collect()
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(256))]

    #[test]
    fn releases_every_event_parents_first((graph, delivery) in arb_delivery(40)) {
        let mut buffer = OrphanBuffer::new();
        let released = deliver(&mut buffer, &delivery);

        prop_assert_eq!(released.len(), graph.len());
        prop_assert_eq!(buffer.orphan_count(), 0);

        let position: HashMap<EventHash, usize> = released
            .iter()
            .enumerate()
            .map(|(i, event)| (event.hash(), i))
            .collect();
        for event in &released {
            for parent in event.parents() {
                prop_assert!(position[&parent.hash] < position[&event.hash()]);
            }
        }
    }

    #[test]
    fn redelivery_never_releases_twice((graph, delivery) in arb_delivery(30)) {
        let mut buffer = OrphanBuffer::new();
        let doubled: Vec<PlatformEvent> = delivery
            .iter()
            .flat_map(|event| [event.clone(), event.clone()])
            .collect();
        let released = deliver(&mut buffer, &doubled);

        prop_assert_eq!(released.len(), graph.len());
        prop_assert_eq!(hashes(&released).len(), graph.len());
        prop_assert_eq!(buffer.stats().duplicates, graph.len() as u64);
    }

    #[test]
    fn release_set_is_independent_of_delivery_order((graph, delivery) in arb_delivery(30)) {
        let mut in_order = OrphanBuffer::new();
        let mut shuffled = OrphanBuffer::new();
        let a = deliver(&mut in_order, &graph);
        let b = deliver(&mut shuffled, &delivery);
        prop_assert_eq!(&a, &graph);
        prop_assert_eq!(hashes(&a), hashes(&b));
    }

    #[test]
    fn ancient_events_are_never_retained(
        (graph, delivery) in arb_delivery(40),
        cut in 0usize..40,
        threshold in 0u64..8,
    ) {
        let cut = cut.min(delivery.len());
        let mut buffer = OrphanBuffer::new();
        let mut released = deliver(&mut buffer, &delivery[..cut]);

        let window = EventWindow::new(threshold, threshold, 0).expect("window");
        released.extend(buffer.advance_window(window).expect("advance"));
        for event in &released[..] {
            let hash = event.hash();
            prop_assert!(!buffer.is_buffered(&hash));
        }
        for event in &graph {
            if window.is_ancient(event.birth_round()) {
                prop_assert!(!buffer.is_buffered(&event.hash()));
            }
        }

        let late = deliver(&mut buffer, &delivery[cut..]);
        for event in &late {
            prop_assert!(!window.is_ancient(event.birth_round()));
        }
        prop_assert!(hashes(&released).is_disjoint(&hashes(&late)));
        prop_assert_eq!(buffer.orphan_count(), 0);
    }
}
