//! Startup replay of the event log.
//!
//! Replay re-drives every logged event through the same intake path as live
//! gossip, with the log in replay mode so nothing is written twice. It is a
//! blocking phase: live intake must not start until it returns, and it is
//! abandoned as unhealthy once it exceeds its time budget.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::config::PcesConfig;
use crate::error::ErrorCode;
use crate::event::{EventOrigin, PlatformEvent, Round};
use crate::intake::{DurableLog, IntakeError, IntakePipeline};
use crate::pces::{PcesError, PcesReader};

/// Errors that abort replay. All of them are fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("replay requested after the log began streaming new events")]
    AlreadyStreaming,

    #[error(
        "replay exceeded its time budget ({elapsed:?} > {budget:?}) after {events_read} events"
    )]
    Unhealthy {
        elapsed: Duration,
        budget: Duration,
        events_read: u64,
    },

    #[error(transparent)]
    Log(#[from] PcesError),

    #[error(transparent)]
    Intake(#[from] IntakeError),
}

impl ReplayError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyStreaming => ErrorCode::ReplayWhileStreaming,
            Self::Unhealthy { .. } => ErrorCode::ReplayUnhealthy,
            Self::Log(err) => err.code(),
            Self::Intake(err) => err.code(),
        }
    }

    /// Whether the log no longer covers the rounds replay needed.
    #[must_use]
    pub const fn is_uncovered_range(&self) -> bool {
        matches!(self, Self::Log(PcesError::UncoveredRange { .. }))
    }
}

/// Startup orchestration hooks. All default to no-ops.
pub trait ReplayLifecycle {
    fn begin_replay(&mut self) {}

    /// An event replay made durable-and-released, in release order.
    fn deliver(&mut self, _event: PlatformEvent) {}

    fn end_replay(&mut self, _report: &ReplayReport) {}
}

impl ReplayLifecycle for () {}

/// Collects delivered events.
impl ReplayLifecycle for Vec<PlatformEvent> {
    fn deliver(&mut self, event: PlatformEvent) {
        self.push(event);
    }
}

/// What a completed replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub files_read: usize,
    pub events_read: u64,
    /// Events released by intake and delivered. Zero when intake's log is a
    /// worker, which forwards on its own channel.
    pub events_released: u64,
    pub elapsed: Duration,
}

/// Drives a [`PcesReader`] through an [`IntakePipeline`].
#[derive(Debug, Clone, Copy)]
pub struct Replayer {
    budget: Duration,
}

impl Replayer {
    #[must_use]
    pub const fn new(config: &PcesConfig) -> Self {
        Self {
            budget: config.intake.replay_time_budget(),
        }
    }

    #[must_use]
    pub const fn with_budget(budget: Duration) -> Self {
        Self { budget }
    }

    /// Replay every event `reader` yields, then switch intake's log to
    /// streaming.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::AlreadyStreaming`] if the log is already
    /// writing, [`ReplayError::Unhealthy`] on budget overrun, or the read or
    /// intake error that stopped replay.
    pub fn replay<L: DurableLog>(
        &self,
        reader: &PcesReader,
        intake: &mut IntakePipeline<L>,
        lifecycle: &mut impl ReplayLifecycle,
    ) -> Result<ReplayReport, ReplayError> {
        if intake.log().is_streaming() {
            return Err(ReplayError::AlreadyStreaming);
        }

        let started = Instant::now();
        lifecycle.begin_replay();
        info!(
            dir = %reader.dir().display(),
            files = reader.files().len(),
            lower_bound = reader.lower_bound(),
            origin = reader.origin(),
            "event log replay starting"
        );

        let mut events_read = 0u64;
        let mut events_released = 0u64;
        for event in reader.events() {
            let event = event?;
            events_read += 1;
            for released in intake.submit(event, EventOrigin::Storage)? {
                events_released += 1;
                lifecycle.deliver(released);
            }

            let elapsed = started.elapsed();
            if elapsed > self.budget {
                error!(
                    elapsed_ms = elapsed.as_millis(),
                    budget_ms = self.budget.as_millis(),
                    events_read,
                    "event log replay exceeded its time budget; node is unhealthy"
                );
                return Err(ReplayError::Unhealthy {
                    elapsed,
                    budget: self.budget,
                    events_read,
                });
            }
        }

        intake.begin_streaming_new_events()?;
        let report = ReplayReport {
            files_read: reader.files().len(),
            events_read,
            events_released,
            elapsed: started.elapsed(),
        };
        lifecycle.end_replay(&report);
        info!(
            files = report.files_read,
            events_read,
            events_released,
            orphans = intake.buffer().orphan_count(),
            elapsed_ms = report.elapsed.as_millis(),
            "event log replay complete"
        );
        Ok(report)
    }

    /// Open the log in `dir` and replay it.
    ///
    /// # Errors
    ///
    /// As [`PcesReader::open`] and [`replay`](Self::replay); an uncovered
    /// range surfaces as [`ReplayError::Log`].
    pub fn replay_directory<L: DurableLog>(
        &self,
        config: &PcesConfig,
        dir: &Path,
        starting_round: Round,
        lower_bound: Round,
        intake: &mut IntakePipeline<L>,
        lifecycle: &mut impl ReplayLifecycle,
    ) -> Result<(PcesReader, ReplayReport), ReplayError> {
        let reader = PcesReader::open(config, dir, starting_round, lower_bound)?;
        let report = self.replay(&reader, intake, lifecycle)?;
        Ok((reader, report))
    }
}
