//! Injectable instrumentation for the intake pipeline.
//!
//! Components take an `Arc<dyn IntakeObserver>` instead of reaching for
//! process-wide counters. [`NoopObserver`] is the default; [`StageTimings`]
//! records per-stage latency samples and counters for diagnostics.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::json;

/// Pipeline stage being timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntakeStage {
    Hash,
    Validate,
    Buffer,
    Append,
    Sync,
    WindowAdvance,
}

impl IntakeStage {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Validate => "validate",
            Self::Buffer => "orphan_buffer",
            Self::Append => "log_append",
            Self::Sync => "log_sync",
            Self::WindowAdvance => "window_advance",
        }
    }
}

/// Why intake dropped an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscardReason {
    /// Already ancient on arrival.
    Ancient,
    /// Exact re-delivery of a known event.
    Duplicate,
    /// Failed internal validation.
    Invalid,
}

impl DiscardReason {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ancient => "ancient",
            Self::Duplicate => "duplicate",
            Self::Invalid => "invalid",
        }
    }
}

/// Receives instrumentation callbacks. Every method defaults to a no-op.
pub trait IntakeObserver: Send + Sync {
    fn on_stage(&self, _stage: IntakeStage, _elapsed: Duration) {}

    fn on_released(&self, _count: usize) {}

    fn on_discarded(&self, _reason: DiscardReason) {}

    fn on_file_rotated(&self, _sequence: u64) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl IntakeObserver for NoopObserver {}

/// Shared no-op observer.
#[must_use]
pub fn noop() -> Arc<dyn IntakeObserver> {
    Arc::new(NoopObserver)
}

/// Run `f` and report its duration for `stage`.
pub fn timed<R>(observer: &dyn IntakeObserver, stage: IntakeStage, f: impl FnOnce() -> R) -> R {
    let started = Instant::now();
    let result = f();
    observer.on_stage(stage, started.elapsed());
    result
}

#[derive(Debug, Default)]
struct Recorded {
    samples: BTreeMap<IntakeStage, Vec<Duration>>,
    discarded: BTreeMap<DiscardReason, u64>,
    released: u64,
    rotations: u64,
}

/// Recording observer producing a [`TimingReport`].
#[derive(Debug, Default)]
pub struct StageTimings {
    inner: Mutex<Recorded>,
}

impl StageTimings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Snapshot everything recorded so far. Samples are kept.
    #[must_use]
    pub fn report(&self) -> TimingReport {
        self.with(|recorded| {
            let stages = recorded
                .samples
                .iter()
                .map(|(stage, values)| {
                    let mut sorted = values.clone();
                    sorted.sort_unstable();
                    StageTiming {
                        name: stage.name(),
                        p50: percentile(&sorted, 50),
                        p95: percentile(&sorted, 95),
                        p99: percentile(&sorted, 99),
                        count: sorted.len(),
                    }
                })
                .collect();

            TimingReport {
                stages,
                released: recorded.released,
                discarded: recorded
                    .discarded
                    .iter()
                    .map(|(reason, count)| (reason.name(), *count))
                    .collect(),
                rotations: recorded.rotations,
            }
        })
    }

    /// Drop all recorded samples and counters.
    pub fn clear(&self) {
        self.with(|recorded| *recorded = Recorded::default());
    }
}

impl IntakeObserver for StageTimings {
    fn on_stage(&self, stage: IntakeStage, elapsed: Duration) {
        self.with(|recorded| recorded.samples.entry(stage).or_default().push(elapsed));
    }

    fn on_released(&self, count: usize) {
        self.with(|recorded| recorded.released += count as u64);
    }

    fn on_discarded(&self, reason: DiscardReason) {
        self.with(|recorded| *recorded.discarded.entry(reason).or_default() += 1);
    }

    fn on_file_rotated(&self, _sequence: u64) {
        self.with(|recorded| recorded.rotations += 1);
    }
}

/// Latency percentiles for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTiming {
    pub name: &'static str,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub count: usize,
}

/// Aggregated view of a [`StageTimings`] recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingReport {
    pub stages: Vec<StageTiming>,
    pub released: u64,
    pub discarded: BTreeMap<&'static str, u64>,
    pub rotations: u64,
}

impl TimingReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty() && self.released == 0 && self.discarded.is_empty()
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let stages = self
            .stages
            .iter()
            .map(|stage| {
                json!({
                    "name": stage.name,
                    "count": stage.count,
                    "p50_us": stage.p50.as_micros(),
                    "p95_us": stage.p95.as_micros(),
                    "p99_us": stage.p99.as_micros(),
                })
            })
            .collect::<Vec<_>>();

        json!({
            "stages": stages,
            "released": self.released,
            "discarded": self.discarded,
            "rotations": self.rotations,
        })
    }

    /// Render the report as a table for terminal output.
    #[must_use]
    pub fn display_table(&self) -> String {
        if self.stages.is_empty() {
            return "No timing samples recorded.".to_string();
        }

        let mut out = String::new();
        out.push_str("stage                        count      p50      p95      p99\n");
        out.push_str("--------------------------------------------------------------\n");

        for stage in &self.stages {
            let _ = writeln!(
                out,
                "{:<28} {:>6} {:>8} {:>8} {:>8}",
                stage.name,
                stage.count,
                format_duration(stage.p50),
                format_duration(stage.p95),
                format_duration(stage.p99)
            );
        }

        out
    }
}

fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }

    let rank = pct.min(100).saturating_mul(sorted.len()).saturating_add(99) / 100;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);

    sorted[index]
}

fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros >= 1_000_000 {
        format!("{}.{:03}s", micros / 1_000_000, (micros % 1_000_000) / 1_000)
    } else if micros >= 1_000 {
        format!("{}.{:03}ms", micros / 1_000, micros % 1_000)
    } else {
        format!("{micros}us")
    }
}
