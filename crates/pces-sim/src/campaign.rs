//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds with one set of parameters, collecting pass/fail
//! results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::generator::GraphConfig;
use crate::network::FaultConfig;
use crate::simulator::{SimulationConfig, SimulationResult, Simulator};

/// How many seeds to run and what each run looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Range of seeds to execute, e.g., `0..100`.
    pub seed_range: Range<u64>,
    /// Creating nodes per graph.
    pub nodes: u64,
    /// Events per graph.
    pub events: usize,
    /// Chance that an event starts a new round (percent, 0–100).
    pub round_advance_percent: u8,
    /// Maximum delivery delay in steps.
    pub fault_max_delay: u8,
    /// Message duplication probability (percent, 0–100).
    pub fault_duplicate_percent: u8,
    /// Reordering probability per delivery step (percent, 0–100).
    pub fault_reorder_percent: u8,
    /// Crash probability per seed (percent, 0–100).
    pub crash_percent: u8,
    /// Torn tail probability per crash (percent, 0–100).
    pub torn_tail_percent: u8,
    /// Arrivals between window advances.
    pub window_interval: usize,
    pub ancient_lag: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..50,
            nodes: sim.graph.nodes,
            events: sim.graph.events,
            round_advance_percent: sim.graph.round_advance_percent,
            fault_max_delay: sim.fault.max_delay_steps,
            fault_duplicate_percent: sim.fault.duplicate_rate_percent,
            fault_reorder_percent: sim.fault.reorder_rate_percent,
            crash_percent: sim.crash_rate_percent,
            torn_tail_percent: sim.torn_tail_percent,
            window_interval: sim.window_interval,
            ancient_lag: sim.ancient_lag,
        }
    }
}

impl CampaignConfig {
    /// Build a [`SimulationConfig`] for a specific seed.
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        let defaults = SimulationConfig::default();
        SimulationConfig {
            seed,
            graph: GraphConfig {
                nodes: self.nodes,
                events: self.events,
                round_advance_percent: self.round_advance_percent,
                ..defaults.graph
            },
            fault: FaultConfig {
                max_delay_steps: self.fault_max_delay,
                duplicate_rate_percent: self.fault_duplicate_percent,
                reorder_rate_percent: self.fault_reorder_percent,
            },
            window_interval: self.window_interval,
            ancient_lag: self.ancient_lag,
            crash_rate_percent: self.crash_percent,
            torn_tail_percent: self.torn_tail_percent,
            ..defaults
        }
    }

    /// Validate configuration before running.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.nodes < 2 {
            bail!("nodes must be >= 2");
        }
        if self.events == 0 {
            bail!("events must be > 0");
        }
        if self.window_interval == 0 {
            bail!("window_interval must be > 0");
        }
        Ok(())
    }
}

/// Failure details for a single seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    /// Invariant violations, or the error that stopped the run.
    pub violations: Vec<String>,
}

/// Aggregate report produced by a campaign run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed (for prioritized replay).
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that crashed and had to replay.
    pub crashes: usize,
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    /// True if every seed passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run a full campaign across all seeds in the config.
///
/// A seed whose run errors out (the log refused to reopen, say) counts as a
/// failure with the error as its only violation; the campaign goes on.
///
/// # Errors
///
/// Returns an error if config validation fails.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        crashes: 0,
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        report.seeds_run += 1;
        let violations = match run_single_seed(seed, config) {
            Ok(result) => {
                if result.crash.is_some() {
                    report.crashes += 1;
                }
                if result.interesting_state_reached() {
                    report.interesting_states_reached += 1;
                }
                result
                    .oracle
                    .violations
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }
            Err(err) => vec![format!("run error: {err:#}")],
        };

        if violations.is_empty() {
            report.seeds_passed += 1;
        } else {
            tracing::warn!(seed, violations = violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure { seed, violations });
        }
    }

    tracing::info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        crashes = report.crashes,
        "campaign complete"
    );
    Ok(report)
}

/// Run a single seed.
///
/// # Errors
///
/// Returns an error if the simulation itself fails. Invariant violations
/// are in the result's oracle.
pub fn run_single_seed(seed: u64, config: &CampaignConfig) -> Result<SimulationResult> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    simulator.run()
}
