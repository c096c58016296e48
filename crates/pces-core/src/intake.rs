//! Live intake: the single ordered path from a raw event to consensus.
//!
//! ```text
//! GossipEvent -> hash -> ancient? -> validate -> seen? -> orphan buffer -> durable log -> consensus
//! ```
//!
//! The pipeline is single-threaded. Concurrent producers must be serialized
//! into one queue in front of [`IntakePipeline::submit`]; that queue and the
//! log worker's queue are the only places backpressure is applied.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::IntakeConfig;
use crate::error::ErrorCode;
use crate::event::{EventHash, EventHasher, EventOrigin, EventValidator, GossipEvent, PlatformEvent, Round};
use crate::observer::{self, DiscardReason, IntakeObserver, IntakeStage};
use crate::orphan::OrphanBuffer;
use crate::pces::{PcesError, PcesWriter};
use crate::window::{EventWindow, WindowError};

/// Where released events go before consensus may see them.
///
/// [`PcesWriter`] appends and syncs inline and hands the events straight
/// back. [`DurableLogWorker`](crate::pces::DurableLogWorker) queues them for
/// its append thread, which forwards them once durable, so it returns
/// nothing.
pub trait DurableLog {
    /// Make `events` durable. Returns the events the caller may now pass to
    /// consensus.
    ///
    /// # Errors
    ///
    /// Any error means the events may not be durable and is fatal.
    fn persist(&mut self, events: Vec<PlatformEvent>) -> Result<Vec<PlatformEvent>, PcesError>;

    /// # Errors
    ///
    /// Returns [`PcesError::Window`] on a regression, or an I/O error while
    /// pruning.
    fn update_event_window(&mut self, window: EventWindow) -> Result<(), PcesError>;

    /// # Errors
    ///
    /// Returns an I/O error if the open file cannot be closed.
    fn register_discontinuity(&mut self, new_origin: Round) -> Result<(), PcesError>;

    /// # Errors
    ///
    /// Returns [`PcesError::WorkerStopped`] if the log is behind a stopped
    /// worker.
    fn begin_streaming_new_events(&mut self) -> Result<(), PcesError>;

    fn is_streaming(&self) -> bool;
}

/// Errors from intake.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// The window update was rejected; nothing changed.
    #[error(transparent)]
    Window(#[from] WindowError),

    /// The durable log failed. The node must halt.
    #[error(transparent)]
    Log(#[from] PcesError),
}

impl IntakeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Window(err) => err.code(),
            Self::Log(err) => err.code(),
        }
    }

    /// True when the node must halt rather than continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Window(_) => false,
            Self::Log(_) => true,
        }
    }
}

/// Intake counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    pub submitted: u64,
    pub ancient: u64,
    pub invalid: u64,
    pub duplicates: u64,
    /// Events released by the orphan buffer and handed to the log.
    pub released: u64,
}

/// Hasher, validator, deduplication, orphan buffer and durable log, in
/// order.
pub struct IntakePipeline<L: DurableLog = PcesWriter> {
    hasher: EventHasher,
    validator: EventValidator,
    seen: BTreeMap<Round, HashSet<EventHash>>,
    buffer: OrphanBuffer,
    log: L,
    observer: Arc<dyn IntakeObserver>,
    stats: IntakeStats,
}

impl<L: DurableLog + std::fmt::Debug> std::fmt::Debug for IntakePipeline<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntakePipeline")
            .field("window", &self.buffer.event_window())
            .field("orphans", &self.buffer.orphan_count())
            .field("log", &self.log)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<L: DurableLog> IntakePipeline<L> {
    #[must_use]
    pub fn new(config: &IntakeConfig, log: L) -> Self {
        Self {
            hasher: EventHasher::new(),
            validator: EventValidator::new(config.max_transaction_bytes_per_event),
            seen: BTreeMap::new(),
            buffer: OrphanBuffer::new(),
            log,
            observer: observer::noop(),
            stats: IntakeStats::default(),
        }
    }

    /// Start from `window` instead of genesis, e.g. the window of a loaded
    /// state before replay.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Log`] if the log rejects the window.
    pub fn with_window(mut self, window: EventWindow) -> Result<Self, IntakeError> {
        self.buffer = OrphanBuffer::with_window(window);
        self.log.update_event_window(window)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn IntakeObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub const fn event_window(&self) -> EventWindow {
        self.buffer.event_window()
    }

    #[must_use]
    pub const fn buffer(&self) -> &OrphanBuffer {
        &self.buffer
    }

    #[must_use]
    pub const fn log(&self) -> &L {
        &self.log
    }

    pub const fn log_mut(&mut self) -> &mut L {
        &mut self.log
    }

    #[must_use]
    pub fn into_log(self) -> L {
        self.log
    }

    #[must_use]
    pub const fn stats(&self) -> IntakeStats {
        self.stats
    }

    /// Hash and submit a raw event. Returns the events that are now durable
    /// and may go to consensus, parents first.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Log`] if the log fails; that is fatal.
    pub fn submit(
        &mut self,
        event: GossipEvent,
        origin: EventOrigin,
    ) -> Result<Vec<PlatformEvent>, IntakeError> {
        let hasher = self.hasher;
        let event = observer::timed(self.observer.as_ref(), IntakeStage::Hash, || {
            hasher.hash(event, origin)
        });
        self.submit_hashed(event)
    }

    /// Submit an event that is already hashed.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Log`] if the log fails; that is fatal.
    pub fn submit_hashed(&mut self, event: PlatformEvent) -> Result<Vec<PlatformEvent>, IntakeError> {
        self.stats.submitted += 1;
        let round = event.birth_round();

        if self.buffer.event_window().is_ancient(round) {
            self.stats.ancient += 1;
            self.observer.on_discarded(DiscardReason::Ancient);
            trace!(hash = %event.hash().short(), birth_round = round, "ancient on intake");
            return Ok(Vec::new());
        }

        let validator = self.validator;
        let verdict = observer::timed(self.observer.as_ref(), IntakeStage::Validate, || {
            validator.validate(event.gossip())
        });
        if let Err(err) = verdict {
            self.stats.invalid += 1;
            self.observer.on_discarded(DiscardReason::Invalid);
            warn!(
                hash = %event.hash().short(),
                creator = %event.creator(),
                origin = ?event.origin(),
                error = %err,
                "discarding invalid event"
            );
            return Ok(Vec::new());
        }

        if !self.seen.entry(round).or_default().insert(event.hash()) {
            self.stats.duplicates += 1;
            self.observer.on_discarded(DiscardReason::Duplicate);
            return Ok(Vec::new());
        }

        let buffer = &mut self.buffer;
        let released = observer::timed(self.observer.as_ref(), IntakeStage::Buffer, || {
            buffer.submit(event)
        });
        self.persist(released)
    }

    /// Move to `window`: prune, release what the new window completes, and
    /// tell the log.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Window`] on a regression (nothing changes), or
    /// [`IntakeError::Log`] if the log fails.
    pub fn advance_window(&mut self, window: EventWindow) -> Result<Vec<PlatformEvent>, IntakeError> {
        let buffer = &mut self.buffer;
        let released = observer::timed(self.observer.as_ref(), IntakeStage::WindowAdvance, || {
            buffer.advance_window(window)
        })?;
        self.seen = self.seen.split_off(&window.non_ancient_boundary());
        self.log.update_event_window(window)?;
        debug!(
            ancient_threshold = window.ancient_threshold(),
            expired_threshold = window.expired_threshold(),
            released = released.len(),
            "intake window advanced"
        );
        self.persist(released)
    }

    /// The graph restarts at `new_origin`: forget everything buffered and
    /// start a new log segment.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Log`] if the log fails.
    pub fn register_discontinuity(&mut self, new_origin: Round) -> Result<(), IntakeError> {
        let dropped = self.buffer.orphan_count();
        self.buffer.clear();
        self.seen.clear();
        self.log.register_discontinuity(new_origin)?;
        info!(new_origin, orphans_dropped = dropped, "intake discontinuity");
        Ok(())
    }

    /// Replay is over; the log starts writing.
    ///
    /// # Errors
    ///
    /// Returns [`IntakeError::Log`] if the log is behind a stopped worker.
    pub fn begin_streaming_new_events(&mut self) -> Result<(), IntakeError> {
        self.log.begin_streaming_new_events()?;
        Ok(())
    }

    fn persist(&mut self, released: Vec<PlatformEvent>) -> Result<Vec<PlatformEvent>, IntakeError> {
        if released.is_empty() {
            return Ok(released);
        }
        let count = released.len();
        self.stats.released += count as u64;
        self.observer.on_released(count);
        Ok(self.log.persist(released)?)
    }
}
