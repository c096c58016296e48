use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::PcesError;
use super::file::PcesFile;
use super::format::{FrameError, FrameReader};
use super::recovery::{RecoveryReport, recover_files};
use super::recycle::RecycleBin;
use super::tracker::{PcesFileTracker, read_files_from_disk};
use crate::config::PcesConfig;
use crate::event::{EventCodec, GossipEvent, Round};
use crate::lock::LogDirLock;

/// Read side of the event log: the files that survived startup recovery and
/// a way to iterate their events from a lower bound.
#[derive(Debug)]
pub struct PcesReader {
    dir: PathBuf,
    files: Vec<PcesFile>,
    lower_bound: Round,
    codec: EventCodec,
    tracker: PcesFileTracker,
    report: RecoveryReport,
}

impl PcesReader {
    /// Discover, validate and repair the log in `dir`.
    ///
    /// `starting_round` is the round of the state being loaded and selects
    /// the origin; `lower_bound` is the first birth round replay needs. The
    /// directory lock is held only while files are repaired or recycled.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::SequenceGap`] for an unexplained missing file,
    /// [`PcesError::UncoveredRange`] if a recycled file was the only cover for
    /// rounds at or above `lower_bound`, or [`PcesError::Lock`] /
    /// [`PcesError::Io`] on file system trouble.
    pub fn open(
        config: &PcesConfig,
        dir: &Path,
        starting_round: Round,
        lower_bound: Round,
    ) -> Result<Self, PcesError> {
        let codec = EventCodec::new(config.log.max_event_bytes);
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "no event log directory; nothing to replay");
            return Ok(Self {
                dir: dir.to_path_buf(),
                files: Vec::new(),
                lower_bound,
                codec,
                tracker: PcesFileTracker::new(starting_round),
                report: RecoveryReport::default(),
            });
        }

        let lock = LogDirLock::acquire(dir, config.log.lock_timeout())?;
        let mut tracker = read_files_from_disk(&config.log, dir, starting_round)?;
        let newest = tracker.last().map(PcesFile::sequence);
        let candidates: Vec<PcesFile> = tracker
            .file_iterator(lower_bound, tracker.origin())
            .cloned()
            .collect();

        let bin = RecycleBin::for_log(dir, &config.log.recycle_dir_name);
        let recovered = recover_files(candidates, newest, lower_bound, &bin, &codec)?;
        for recycled in &recovered.report.recycled {
            tracker.remove(recycled.file.sequence());
        }
        lock.release();

        if recovered.report.is_clean() {
            debug!(
                dir = %dir.display(),
                files = recovered.survivors.len(),
                events = recovered.report.events_found,
                lower_bound,
                origin = tracker.origin(),
                "event log opened for replay"
            );
        } else {
            info!(
                dir = %dir.display(),
                files = recovered.survivors.len(),
                events = recovered.report.events_found,
                truncated = recovered.report.truncated.len(),
                recycled = recovered.report.recycled.len(),
                "event log opened for replay after repair"
            );
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            files: recovered.survivors,
            lower_bound,
            codec,
            tracker,
            report: recovered.report,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files replay will read, oldest first.
    #[must_use]
    pub fn files(&self) -> &[PcesFile] {
        &self.files
    }

    #[must_use]
    pub const fn lower_bound(&self) -> Round {
        self.lower_bound
    }

    #[must_use]
    pub const fn origin(&self) -> Round {
        self.tracker.origin()
    }

    /// Every file left in the directory after recovery, for the writer to
    /// continue from.
    #[must_use]
    pub const fn tracker(&self) -> &PcesFileTracker {
        &self.tracker
    }

    #[must_use]
    pub fn into_tracker(self) -> PcesFileTracker {
        self.tracker
    }

    #[must_use]
    pub const fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// A fresh iterator from the first event at or above the lower bound.
    /// Each call starts over from the beginning.
    #[must_use]
    pub fn events(&self) -> PcesEventIterator {
        PcesEventIterator {
            files: self.files.iter().cloned().collect(),
            current: None,
            codec: self.codec,
            lower_bound: self.lower_bound,
            failed: false,
        }
    }
}

/// Open file being iterated.
#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    frames: FrameReader<BufReader<File>>,
}

/// Lazy, forward-only iterator over logged events. Stops after the first
/// error.
#[derive(Debug)]
pub struct PcesEventIterator {
    files: VecDeque<PcesFile>,
    current: Option<OpenFile>,
    codec: EventCodec,
    lower_bound: Round,
    failed: bool,
}

impl PcesEventIterator {
    fn open_next(&mut self) -> Result<bool, PcesError> {
        let Some(file) = self.files.pop_front() else {
            return Ok(false);
        };
        let handle = BufReader::new(File::open(file.path())?);
        let frames = FrameReader::new(handle, self.codec.max_event_bytes())
            .map_err(|err| corrupt(file.path(), &err))?;
        self.current = Some(OpenFile {
            path: file.path().to_path_buf(),
            frames,
        });
        Ok(true)
    }

    fn next_event(&mut self) -> Result<Option<GossipEvent>, PcesError> {
        loop {
            if self.current.is_none() && !self.open_next()? {
                return Ok(None);
            }
            let Some(open) = self.current.as_mut() else {
                return Ok(None);
            };

            let offset = open.frames.offset();
            match open.frames.next_frame() {
                Ok(Some(payload)) => {
                    let event = self.codec.decode(&payload).map_err(|err| PcesError::Corrupt {
                        path: open.path.clone(),
                        offset,
                        reason: format!("undecodable event: {err}"),
                    })?;
                    if event.birth_round() >= self.lower_bound {
                        return Ok(Some(event));
                    }
                }
                Ok(None) => self.current = None,
                Err(err) => return Err(corrupt(&open.path, &err)),
            }
        }
    }
}

impl Iterator for PcesEventIterator {
    type Item = Result<GossipEvent, PcesError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_event() {
            Ok(event) => event.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn corrupt(path: &Path, err: &FrameError) -> PcesError {
    match err {
        FrameError::Io(io) => PcesError::Io(std::io::Error::new(io.kind(), io.to_string())),
        other => PcesError::Corrupt {
            path: path.to_path_buf(),
            offset: other.offset(),
            reason: other.to_string(),
        },
    }
}
