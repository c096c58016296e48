//! pces-sim library.
//!
//! Seeded end-to-end runs of live intake and the event log: a generated
//! graph arrives through a delaying, duplicating, reordering network; the
//! node may crash and restart from its log; an oracle checks what consensus
//! would have seen.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types. Invariant violations
//!   are data in [`OracleResult`], not errors.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).
//! - **Determinism**: all randomness comes from [`DeterministicRng`]; a seed
//!   fully determines a run.

pub mod campaign;
pub mod generator;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod simulator;

pub use campaign::{CampaignConfig, CampaignReport, SeedFailure, run_campaign, run_single_seed};
pub use oracle::{IntakeOracle, InvariantViolation, OracleResult};
pub use rng::DeterministicRng;
pub use simulator::{CrashReport, SimulationConfig, SimulationResult, Simulator};
