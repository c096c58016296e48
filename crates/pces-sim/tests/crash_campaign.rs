use pces_sim::{CampaignConfig, SimulationConfig, Simulator, run_campaign, run_single_seed};

#[test]
fn every_seed_survives_a_crash_with_a_torn_tail() {
    let config = CampaignConfig {
        seed_range: 0..20,
        events: 120,
        crash_percent: 100,
        torn_tail_percent: 100,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).expect("campaign");
    assert!(report.all_passed(), "failures: {:#?}", report.failures);
    assert_eq!(report.crashes, 20);
}

#[test]
fn heavy_faults_without_crashes_pass() {
    let config = CampaignConfig {
        seed_range: 100..110,
        events: 150,
        fault_max_delay: 20,
        fault_duplicate_percent: 40,
        fault_reorder_percent: 60,
        crash_percent: 0,
        ..CampaignConfig::default()
    };
    let report = run_campaign(&config).expect("campaign");
    assert!(report.all_passed(), "failures: {:#?}", report.failures);
    assert_eq!(report.crashes, 0);
}

#[test]
fn slow_windows_release_everything_late_arrivals_need() {
    // A long lag keeps nearly everything non-ancient, so completeness is
    // checked against almost the whole graph.
    let config = CampaignConfig {
        seed_range: 0..5,
        events: 100,
        ancient_lag: 1_000,
        ..CampaignConfig::default()
    };
    for seed in config.seed_range.clone() {
        let result = run_single_seed(seed, &config).expect("run");
        assert!(result.oracle.passed, "seed {seed}: {:?}", result.oracle.violations);
        assert_eq!(result.ancient_on_arrival, 0);
        assert_eq!(result.final_window.ancient_threshold(), 0);
        assert_eq!(result.logged, result.events_generated);
    }
}

#[test]
fn a_seed_replays_identically() {
    let config = SimulationConfig {
        seed: 77,
        crash_rate_percent: 100,
        ..SimulationConfig::default()
    };
    let first = Simulator::new(config.clone()).expect("sim").run().expect("run");
    let second = Simulator::new(config).expect("sim").run().expect("run");
    assert_eq!(first.crash, second.crash);
    assert_eq!(first.released, second.released);
    assert_eq!(first.logged, second.logged);
    assert_eq!(first.oracle, second.oracle);
}
