//! One seeded run of intake and the event log under faulty gossip.
//!
//! ```text
//! generate graph -> schedule arrivals -> live intake ... crash
//!   -> repair + replay -> re-sync delivered events -> live intake -> close
//!   -> read log back -> oracle
//! ```
//!
//! The crash drops intake and its writer without closing anything. A torn
//! tail may then be appended to the newest file, as if the process died in
//! the middle of an append that was never released.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use pces_core::config::{LogConfig, PcesConfig};
use pces_core::event::{EventHash, EventHasher, EventOrigin, PlatformEvent, Round};
use pces_core::intake::IntakePipeline;
use pces_core::pces::{PcesFile, PcesFileTracker, PcesReader, PcesWriter, read_files_from_disk};
use pces_core::replay::Replayer;
use pces_core::window::EventWindow;

use crate::generator::{GraphConfig, generate};
use crate::network::{FaultConfig, GossipMessage, SimulatedNetwork};
use crate::oracle::{IntakeOracle, OracleResult, Release, Stream};
use crate::rng::DeterministicRng;

/// Partial frame header appended to fake a torn write.
const TORN_TAIL: [u8; 5] = [0x40, 0, 0, 0, 0xEE];

/// Configuration for one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub graph: GraphConfig,
    pub fault: FaultConfig,
    /// Arrivals between event window advances.
    pub window_interval: usize,
    /// Rounds between the highest released round and the ancient threshold.
    pub ancient_lag: Round,
    /// Rounds between the ancient and the expired threshold.
    pub expired_lag: Round,
    /// Chance that the process crashes somewhere in the schedule (percent).
    pub crash_rate_percent: u8,
    /// Chance that a crash leaves a torn frame on the newest file (percent).
    pub torn_tail_percent: u8,
    pub pces: PcesConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            graph: GraphConfig::default(),
            fault: FaultConfig::default(),
            window_interval: 10,
            ancient_lag: 3,
            expired_lag: 2,
            crash_rate_percent: 75,
            torn_tail_percent: 50,
            pces: PcesConfig {
                log: LogConfig {
                    bootstrap_span: 2,
                    bootstrap_span_overlap_factor: 1.0,
                    span_overlap_factor: 1.5,
                    minimum_span: 1,
                    ..LogConfig::default()
                },
                ..PcesConfig::default()
            },
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if the graph or the window cadence is empty, or the
    /// log settings are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.graph.events == 0 {
            bail!("graph.events must be > 0");
        }
        if self.graph.nodes < 2 {
            bail!("graph.nodes must be >= 2");
        }
        if self.window_interval == 0 {
            bail!("window_interval must be > 0");
        }
        self.pces.validate()?;
        Ok(())
    }
}

/// Where the crash landed, if one happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Arrivals processed before the crash.
    pub after_arrivals: usize,
    pub torn_tail: bool,
    /// Window the restarted node loaded.
    pub window: EventWindow,
    /// Events delivered by replay.
    pub replayed: usize,
    /// Files truncated or recycled when the log was reopened.
    pub repaired_files: usize,
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationResult {
    pub seed: u64,
    pub events_generated: usize,
    pub arrivals: usize,
    pub duplicate_arrivals: usize,
    /// Events live intake released, across both process lifetimes.
    pub released: usize,
    /// Events intake dropped because they were ancient on arrival.
    pub ancient_on_arrival: u64,
    pub crash: Option<CrashReport>,
    pub final_window: EventWindow,
    /// Non-ancient events read back from the closed log.
    pub logged: usize,
    pub oracle: OracleResult,
}

impl SimulationResult {
    /// A crash with a torn tail plus at least one ancient drop: the states
    /// worth a second look when a campaign passes too easily.
    #[must_use]
    pub fn interesting_state_reached(&self) -> bool {
        self.crash.is_some_and(|crash| crash.torn_tail && crash.replayed > 0)
            && self.ancient_on_arrival > 0
    }
}

/// Derives event windows from what has been released: the ancient threshold
/// trails the highest released round by a fixed lag.
#[derive(Debug, Clone, Copy)]
struct WindowPolicy {
    ancient_lag: Round,
    expired_lag: Round,
    highest_round: Round,
    current: EventWindow,
}

impl WindowPolicy {
    const fn new(ancient_lag: Round, expired_lag: Round) -> Self {
        Self {
            ancient_lag,
            expired_lag,
            highest_round: 0,
            current: EventWindow::genesis(),
        }
    }

    fn observe(&mut self, releases: &[Release]) {
        for release in releases {
            self.highest_round = self.highest_round.max(release.event.birth_round());
        }
    }

    /// The next window, if it differs from the current one.
    fn next(&mut self) -> Result<Option<EventWindow>> {
        let ancient = self
            .highest_round
            .saturating_sub(self.ancient_lag)
            .max(self.current.ancient_threshold());
        let expired = ancient
            .saturating_sub(self.expired_lag)
            .max(self.current.expired_threshold());
        let next = EventWindow::new(self.highest_round, ancient, expired)?;
        if next == self.current {
            return Ok(None);
        }
        self.current = next;
        Ok(Some(next))
    }
}

/// Everything one process lifetime released.
#[derive(Debug, Default)]
struct Session {
    replayed: Vec<Release>,
    live: Vec<Release>,
    ancient_on_arrival: u64,
}

impl Session {
    /// Replay followed by live intake, in release order.
    fn releases(&self) -> Vec<Release> {
        self.replayed.iter().chain(&self.live).cloned().collect()
    }
}

/// Runs one seeded scenario in a scratch directory.
pub struct Simulator {
    config: SimulationConfig,
    rng: DeterministicRng,
    _scratch: TempDir,
    dir: PathBuf,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the scratch directory
    /// cannot be created.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let scratch = TempDir::new().context("creating simulation scratch directory")?;
        let dir = scratch.path().join("pces");
        Ok(Self {
            rng: DeterministicRng::new(config.seed),
            config,
            _scratch: scratch,
            dir,
        })
    }

    /// Directory holding the simulated node's event log.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Run the scenario.
    ///
    /// # Errors
    ///
    /// Any error from the log, intake or replay. Those are failures of the
    /// run itself, not invariant violations; the oracle reports the latter
    /// in the result.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let graph = generate(&self.config.graph, &mut self.rng);
        let mut network = SimulatedNetwork::new(self.config.fault);
        let arrivals = network.schedule(graph.len(), &mut self.rng);
        let crash_at = self
            .rng
            .hit_rate_percent(self.config.crash_rate_percent)
            .then(|| self.rng.next_index(arrivals.len() + 1));
        let torn_tail = self.rng.hit_rate_percent(self.config.torn_tail_percent);
        debug!(
            seed = self.config.seed,
            events = graph.len(),
            arrivals = arrivals.len(),
            ?crash_at,
            "simulation scheduled"
        );

        let mut policy = WindowPolicy::new(self.config.ancient_lag, self.config.expired_lag);
        let pces = self.config.pces.clone();

        // First lifetime.
        let writer = PcesWriter::open(&pces.log, &self.dir, PcesFileTracker::new(0))?;
        let mut intake = IntakePipeline::new(&pces.intake, writer);
        intake.begin_streaming_new_events()?;
        let mut first = Session::default();
        let cut = crash_at.unwrap_or(arrivals.len());
        self.drive(&mut intake, &graph, &arrivals[..cut], &mut policy, &mut first)?;

        let (mut intake, mut second, crash) = match crash_at {
            None => (intake, Session::default(), None),
            Some(after_arrivals) => {
                drop(intake);
                let torn = torn_tail && tear_newest_file(&pces.log, &self.dir)?;
                let (mut intake, replayed, repaired_files) =
                    self.restart(&pces, policy.current)?;
                let mut second = Session {
                    replayed,
                    ..Session::default()
                };
                // Peers resend everything they sent before the crash.
                self.drive(&mut intake, &graph, &arrivals[..after_arrivals], &mut policy, &mut second)?;
                let crash = CrashReport {
                    after_arrivals,
                    torn_tail: torn,
                    window: policy.current,
                    replayed: second.replayed.len(),
                    repaired_files,
                };
                (intake, second, Some(crash))
            }
        };
        if crash.is_some() {
            self.drive(&mut intake, &graph, &arrivals[cut..], &mut policy, &mut second)?;
        }

        let final_window = intake.event_window();
        intake.into_log().close()?;
        let logged = self.read_back(&pces, final_window)?;

        let oracle = check(&graph, &first, &second, crash.as_ref(), final_window, &logged);
        let released = first.live.len() + second.live.len();
        let result = SimulationResult {
            seed: self.config.seed,
            events_generated: graph.len(),
            arrivals: arrivals.len(),
            duplicate_arrivals: arrivals.iter().filter(|message| message.duplicate).count(),
            released,
            ancient_on_arrival: first.ancient_on_arrival + second.ancient_on_arrival,
            crash,
            final_window,
            logged: logged.len(),
            oracle,
        };
        info!(
            seed = result.seed,
            released = result.released,
            crashed = result.crash.is_some(),
            logged = result.logged,
            passed = result.oracle.passed,
            "simulation complete"
        );
        Ok(result)
    }

    /// Feed `arrivals` to intake, advancing the window every
    /// `window_interval` arrivals.
    fn drive(
        &self,
        intake: &mut IntakePipeline,
        graph: &[PlatformEvent],
        arrivals: &[GossipMessage],
        policy: &mut WindowPolicy,
        session: &mut Session,
    ) -> Result<()> {
        let ancient_before = intake.stats().ancient;
        for (index, message) in arrivals.iter().enumerate() {
            let event = &graph[message.event];
            let threshold = intake.event_window().ancient_threshold();
            let released = intake.submit(event.gossip().clone(), EventOrigin::Gossip)?;
            record(&mut session.live, released, threshold);

            if (index + 1) % self.config.window_interval == 0 {
                policy.observe(&session.live);
                if let Some(window) = policy.next()? {
                    let released = intake.advance_window(window)?;
                    record(&mut session.live, released, window.ancient_threshold());
                }
            }
        }
        session.ancient_on_arrival += intake.stats().ancient - ancient_before;
        Ok(())
    }

    /// Reopen the log as a restarted node would: repair, then replay under
    /// the loaded window.
    fn restart(
        &self,
        pces: &PcesConfig,
        window: EventWindow,
    ) -> Result<(IntakePipeline, Vec<Release>, usize)> {
        let reader = PcesReader::open(
            pces,
            &self.dir,
            window.latest_consensus_round(),
            window.non_ancient_boundary(),
        )?;
        let report = reader.recovery_report();
        let repaired = report.truncated.len() + report.recycled.len();

        let writer = PcesWriter::open(&pces.log, &self.dir, reader.tracker().clone())?;
        let mut intake = IntakePipeline::new(&pces.intake, writer).with_window(window)?;
        let mut delivered: Vec<PlatformEvent> = Vec::new();
        Replayer::new(pces).replay(&reader, &mut intake, &mut delivered)?;

        let mut replayed = Vec::with_capacity(delivered.len());
        record(&mut replayed, delivered, window.ancient_threshold());
        Ok((intake, replayed, repaired))
    }

    /// Hashes of the non-ancient events in the closed log, in file order.
    fn read_back(&self, pces: &PcesConfig, window: EventWindow) -> Result<Vec<EventHash>> {
        let reader = PcesReader::open(
            pces,
            &self.dir,
            window.latest_consensus_round(),
            window.non_ancient_boundary(),
        )?;
        let hasher = EventHasher::new();
        let mut hashes = Vec::new();
        for event in reader.events() {
            let event = event?;
            if !window.is_ancient(event.core.birth_round) {
                hashes.push(hasher.hash_of(&event));
            }
        }
        Ok(hashes)
    }
}

fn record(releases: &mut Vec<Release>, events: Vec<PlatformEvent>, ancient_threshold: Round) {
    releases.extend(events.into_iter().map(|event| Release {
        event,
        ancient_threshold,
    }));
}

/// Append a partial frame to the newest log file. Returns whether there
/// was a file to tear.
fn tear_newest_file(log: &LogConfig, dir: &Path) -> Result<bool> {
    let tracker = read_files_from_disk(log, dir, 0)?;
    let Some(newest) = tracker.last().map(PcesFile::path) else {
        return Ok(false);
    };
    let mut file = OpenOptions::new()
        .append(true)
        .open(newest)
        .with_context(|| format!("opening {} to tear its tail", newest.display()))?;
    file.write_all(&TORN_TAIL)?;
    file.sync_all()?;
    debug!(path = %newest.display(), "tore the newest event log file");
    Ok(true)
}

fn hashes(releases: &[Release], boundary: Round) -> Vec<EventHash> {
    releases
        .iter()
        .filter(|release| release.event.birth_round() >= boundary)
        .map(|release| release.event.hash())
        .collect()
}

fn check(
    graph: &[PlatformEvent],
    first: &Session,
    second: &Session,
    crash: Option<&CrashReport>,
    final_window: EventWindow,
    logged: &[EventHash],
) -> OracleResult {
    let live: Vec<Release> = first.live.iter().chain(&second.live).cloned().collect();
    let second_session = second.releases();
    let everything: Vec<Release> = first.live.iter().chain(&second_session).cloned().collect();

    let mut result = IntakeOracle::check_causal_order(0, &first.live)
        .merge(IntakeOracle::check_causal_order(1, &second_session))
        .merge(IntakeOracle::check_at_most_once(&live))
        .merge(IntakeOracle::check_never_ancient(&everything))
        .merge(IntakeOracle::check_complete(
            graph,
            &live,
            final_window.ancient_threshold(),
        ));

    if let Some(crash) = crash {
        let expected = hashes(&first.live, crash.window.non_ancient_boundary());
        let found: Vec<EventHash> = second.replayed.iter().map(|r| r.event.hash()).collect();
        result = result.merge(IntakeOracle::check_sequence(Stream::Replay, &expected, &found));
    }

    let expected = hashes(&live, final_window.non_ancient_boundary());
    result.merge(IntakeOracle::check_sequence(Stream::Log, &expected, logged))
}
