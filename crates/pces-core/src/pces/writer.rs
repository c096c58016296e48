//! The event log writer.
//!
//! Owns the directory lock, the one file open for append, and the tracker
//! of closed files. Events are appended in orphan-buffer release order,
//! which is topological but not sorted by birth round. A file is rotated
//! only when the next event falls outside its declared bounds or the file
//! reaches the preferred size.
//!
//! # Span heuristic
//!
//! A new file covers `[non-ancient boundary, lower + span]`. While
//! bootstrapping (until the first file fills to the preferred size) the span
//! is `previous span * bootstrap overlap factor`; afterwards it is the
//! running average of utilized spans times the regular overlap factor. The
//! span never ends fewer than `minimum_span` rounds past the next event.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use super::PcesError;
use super::file::PcesFile;
use super::mutable_file::PcesMutableFile;
use super::recycle::RecycleBin;
use super::tracker::PcesFileTracker;
use crate::config::LogConfig;
use crate::event::{EventCodec, PlatformEvent, Round};
use crate::intake::DurableLog;
use crate::lock::LogDirLock;
use crate::observer::{self, IntakeObserver, IntakeStage};
use crate::window::EventWindow;

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Fixed-length running average of utilized file spans.
#[derive(Debug, Clone)]
struct RunningAverage {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl RunningAverage {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn add(&mut self, sample: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn average(&self) -> u64 {
        let len = self.samples.len() as u64;
        if len == 0 {
            return 0;
        }
        self.samples.iter().sum::<u64>() / len
    }
}

/// State behind the span heuristic.
#[derive(Debug, Clone)]
struct SpanPolicy {
    bootstrap: bool,
    previous_span: u64,
    utilization: RunningAverage,
    bootstrap_overlap: f64,
    overlap: f64,
    minimum_span: u64,
}

impl SpanPolicy {
    fn new(config: &LogConfig) -> Self {
        Self {
            bootstrap: true,
            previous_span: config.bootstrap_span,
            utilization: RunningAverage::new(config.span_utilization_running_average_length),
            bootstrap_overlap: config.bootstrap_span_overlap_factor,
            overlap: config.span_overlap_factor,
            minimum_span: config.minimum_span,
        }
    }

    /// Span for a file starting at `lower` that must hold `next_round`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn next_span(&self, lower: Round, next_round: Round) -> u64 {
        let (basis, factor) = if self.bootstrap || self.utilization.is_empty() {
            let factor = if self.bootstrap {
                self.bootstrap_overlap
            } else {
                self.overlap
            };
            (self.previous_span, factor)
        } else {
            (self.utilization.average(), self.overlap)
        };
        let desired = (basis as f64 * factor) as u64;
        let minimum = (next_round + self.minimum_span).saturating_sub(lower);
        desired.max(minimum)
    }

    fn record_closed(&mut self, utilized_span: u64) {
        self.previous_span = utilized_span;
        if !self.bootstrap {
            self.utilization.add(utilized_span);
        }
    }
}

/// Appends events to rotating files in one log directory.
pub struct PcesWriter {
    dir: PathBuf,
    config: LogConfig,
    codec: EventCodec,
    tracker: PcesFileTracker,
    bin: RecycleBin,
    current: Option<PcesMutableFile>,
    window: EventWindow,
    span: SpanPolicy,
    streaming: bool,
    observer: Arc<dyn IntakeObserver>,
    _lock: LogDirLock,
}

impl std::fmt::Debug for PcesWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcesWriter")
            .field("dir", &self.dir)
            .field("files", &self.tracker.len())
            .field("current", &self.current.as_ref().map(PcesMutableFile::descriptor))
            .field("window", &self.window)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

impl PcesWriter {
    /// Open a writer over `dir`, continuing the files in `tracker`.
    ///
    /// The tracker normally comes from the reader used for replay, so the
    /// writer sees exactly the files that survived recovery. The writer
    /// starts in replay mode.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Lock`] if another process holds the directory,
    /// or [`PcesError::Io`] if it cannot be created.
    pub fn open(config: &LogConfig, dir: &Path, tracker: PcesFileTracker) -> Result<Self, PcesError> {
        fs::create_dir_all(dir)?;
        let lock = LogDirLock::acquire(dir, config.lock_timeout())?;
        debug!(
            dir = %dir.display(),
            files = tracker.len(),
            origin = tracker.origin(),
            next_sequence = tracker.next_sequence(),
            "event log writer opened"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            codec: EventCodec::new(config.max_event_bytes),
            bin: RecycleBin::for_log(dir, &config.recycle_dir_name),
            span: SpanPolicy::new(config),
            config: config.clone(),
            tracker,
            current: None,
            window: EventWindow::genesis(),
            streaming: false,
            observer: observer::noop(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn IntakeObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn tracker(&self) -> &PcesFileTracker {
        &self.tracker
    }

    #[must_use]
    pub const fn event_window(&self) -> EventWindow {
        self.window
    }

    /// Descriptor of the file open for append, if any.
    #[must_use]
    pub fn current_file(&self) -> Option<&PcesFile> {
        self.current.as_ref().map(PcesMutableFile::descriptor)
    }

    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Leave replay mode. From now on events are written and old files are
    /// pruned.
    pub fn begin_streaming_new_events(&mut self) {
        if self.streaming {
            warn!("begin_streaming_new_events called while already streaming");
        }
        self.streaming = true;
        info!(dir = %self.dir.display(), "event log streaming new events");
    }

    /// Move to `window`. Raises the lower bound of future files and prunes
    /// files that hold only expired rounds.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Window`] on a regression, or [`PcesError::Io`] if
    /// an expired file cannot be recycled.
    pub fn update_event_window(&mut self, window: EventWindow) -> Result<(), PcesError> {
        self.window.check_advance(&window)?;
        self.window = window;
        self.prune_old_files()?;
        Ok(())
    }

    /// Append `event`. In replay mode, and for events that are already
    /// ancient, this does nothing and returns `false`.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the event may not be durable.
    pub fn write_event(&mut self, event: &PlatformEvent) -> Result<bool, PcesError> {
        if !self.streaming {
            return Ok(false);
        }
        let round = event.birth_round();
        if self.window.is_ancient(round) {
            trace!(
                hash = %event.hash().short(),
                birth_round = round,
                "not logging ancient event"
            );
            return Ok(false);
        }

        let observer = Arc::clone(&self.observer);
        let file = self.prepare_output_stream(round)?;
        observer::timed(observer.as_ref(), IntakeStage::Append, || {
            file.write_event(event.gossip())
        })?;
        if self.config.sync_every_append {
            self.sync()?;
        }
        Ok(true)
    }

    /// Make every event written so far durable.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if flush or fsync fails.
    pub fn sync(&mut self) -> Result<(), PcesError> {
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        let observer = Arc::clone(&self.observer);
        observer::timed(observer.as_ref(), IntakeStage::Sync, || file.sync())
    }

    /// Close the open file, if any, so the next event starts a new one.
    /// Returns whether a file was closed.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if the file cannot be synced.
    pub fn rotate(&mut self) -> Result<bool, PcesError> {
        if self.current.is_none() {
            return Ok(false);
        }
        self.close_file()?;
        Ok(true)
    }

    /// The graph restarts at `new_origin` (e.g. after a reconnect). The open
    /// file is closed and later files carry the new origin.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if the open file cannot be closed.
    pub fn register_discontinuity(&mut self, new_origin: Round) -> Result<bool, PcesError> {
        if !self.streaming {
            warn!(new_origin, "discontinuity registered while replaying");
        }
        let closed = self.rotate();
        self.tracker.set_origin(new_origin);
        info!(new_origin, "event log origin changed");
        closed
    }

    /// Move every closed file whose whole range is expired to the recycle
    /// bin. Does nothing until streaming begins, since replay may still be
    /// reading those files. Returns the number of files pruned.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if a file cannot be moved.
    pub fn prune_old_files(&mut self) -> Result<usize, PcesError> {
        if !self.streaming {
            return Ok(0);
        }
        let expired = self.tracker.remove_expired(self.window.expired_threshold());
        for file in &expired {
            self.bin.recycle(file.path())?;
        }
        if !expired.is_empty() {
            debug!(
                pruned = expired.len(),
                expired_threshold = self.window.expired_threshold(),
                remaining = self.tracker.len(),
                "pruned expired event log files"
            );
        }
        Ok(expired.len())
    }

    /// Close the open file and release the directory lock.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if the final sync fails.
    pub fn close(mut self) -> Result<PcesFileTracker, PcesError> {
        if let Some(file) = self.current.take() {
            let descriptor = file.close()?;
            self.tracker.push(descriptor);
        }
        Ok(std::mem::take(&mut self.tracker))
    }

    /// Return the open file that can take `round`, rotating if needed.
    fn prepare_output_stream(&mut self, round: Round) -> Result<&mut PcesMutableFile, PcesError> {
        if let Some(file) = &self.current {
            let fits = file.can_contain(round);
            let full = file.size() >= self.config.preferred_file_size_megabytes * BYTES_PER_MEGABYTE;
            if !fits || full {
                self.close_file()?;
            }
            if full {
                self.span.bootstrap = false;
            }
        }

        let file = match self.current.take() {
            Some(file) => file,
            None => self.open_file(round)?,
        };
        Ok(self.current.insert(file))
    }

    fn open_file(&self, round: Round) -> Result<PcesMutableFile, PcesError> {
        let lower = self.window.non_ancient_boundary().min(round);
        let upper = lower + self.span.next_span(lower, round);
        let descriptor = PcesFile::new(
            Utc::now(),
            self.tracker.next_sequence(),
            lower,
            upper,
            self.tracker.origin(),
            &self.dir,
        );
        debug!(
            sequence = descriptor.sequence(),
            lower_bound = lower,
            upper_bound = upper,
            origin = descriptor.origin(),
            bootstrap = self.span.bootstrap,
            "opening event log file"
        );
        PcesMutableFile::create(descriptor, self.codec)
    }

    fn close_file(&mut self) -> Result<(), PcesError> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };
        let utilized = file.utilized_span();
        let size = file.size();
        self.span.record_closed(utilized);

        let descriptor = file.close()?;
        info!(
            path = %descriptor.path().display(),
            sequence = descriptor.sequence(),
            bytes = size,
            utilized_span = utilized,
            "event log file closed"
        );
        self.observer.on_file_rotated(descriptor.sequence());
        self.tracker.push(descriptor);
        self.prune_old_files()?;
        Ok(())
    }
}

impl DurableLog for PcesWriter {
    fn persist(&mut self, events: Vec<PlatformEvent>) -> Result<Vec<PlatformEvent>, PcesError> {
        if !self.streaming || events.is_empty() {
            return Ok(events);
        }
        for event in &events {
            self.write_event(event)?;
        }
        self.sync()?;
        Ok(events)
    }

    fn update_event_window(&mut self, window: EventWindow) -> Result<(), PcesError> {
        Self::update_event_window(self, window)
    }

    fn register_discontinuity(&mut self, new_origin: Round) -> Result<(), PcesError> {
        Self::register_discontinuity(self, new_origin).map(|_| ())
    }

    fn begin_streaming_new_events(&mut self) -> Result<(), PcesError> {
        Self::begin_streaming_new_events(self);
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}
