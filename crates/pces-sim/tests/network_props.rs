use pces_sim::DeterministicRng;
use pces_sim::network::{FaultConfig, SimulatedNetwork};
use proptest::prelude::*;

fn arb_fault() -> impl Strategy<Value = FaultConfig> {
    (0u8..16, 0u8..=100, 0u8..=100).prop_map(|(delay, duplicate, reorder)| FaultConfig {
        max_delay_steps: delay,
        duplicate_rate_percent: duplicate,
        reorder_rate_percent: reorder,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn nothing_is_lost_and_copies_are_marked(
        fault in arb_fault(),
        seed in any::<u64>(),
        count in 0usize..200,
    ) {
        let mut network = SimulatedNetwork::new(fault);
        let arrivals = network.schedule(count, &mut DeterministicRng::new(seed));

        let mut originals: Vec<usize> = arrivals
            .iter()
            .filter(|message| !message.duplicate)
            .map(|message| message.event)
            .collect();
        originals.sort_unstable();
        prop_assert_eq!(originals, (0..count).collect::<Vec<_>>());
        prop_assert!(arrivals.len() <= count * 2);
        prop_assert_eq!(network.pending_len(), 0);
    }
}
