use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::file::{FILE_EXTENSION, PcesFile};
use super::recycle::RecycleBin;
use super::PcesError;
use crate::config::LogConfig;
use crate::event::Round;

/// Ordered set of closed event log files plus the origin they are read under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcesFileTracker {
    files: Vec<PcesFile>,
    origin: Round,
    next_sequence: u64,
}

impl PcesFileTracker {
    /// Empty tracker for a fresh directory.
    #[must_use]
    pub const fn new(origin: Round) -> Self {
        Self {
            files: Vec::new(),
            origin,
            next_sequence: 0,
        }
    }

    #[must_use]
    pub fn files(&self) -> &[PcesFile] {
        &self.files
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn first(&self) -> Option<&PcesFile> {
        self.files.first()
    }

    #[must_use]
    pub fn last(&self) -> Option<&PcesFile> {
        self.files.last()
    }

    /// Origin round new files are written under.
    #[must_use]
    pub const fn origin(&self) -> Round {
        self.origin
    }

    pub const fn set_origin(&mut self, origin: Round) {
        self.origin = origin;
    }

    /// Sequence number for the next file. Never reused, even after the
    /// files before it are recycled.
    #[must_use]
    pub const fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Add a closed file. Files must arrive in sequence order.
    pub fn push(&mut self, file: PcesFile) {
        debug_assert!(
            self.files
                .last()
                .is_none_or(|last| last.sequence() < file.sequence()),
            "event log files must be tracked in sequence order"
        );
        self.next_sequence = self.next_sequence.max(file.sequence() + 1);
        self.files.push(file);
    }

    /// Forget the file with `sequence`, returning it.
    pub fn remove(&mut self, sequence: u64) -> Option<PcesFile> {
        let index = self
            .files
            .iter()
            .position(|file| file.sequence() == sequence)?;
        Some(self.files.remove(index))
    }

    /// Remove and return every file whose whole range is at or below
    /// `expired_threshold`.
    pub fn remove_expired(&mut self, expired_threshold: Round) -> Vec<PcesFile> {
        let (expired, kept) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|file| file.upper_bound() <= expired_threshold);
        self.files = kept;
        expired
    }

    /// Files of `origin` to read for events at or above `lower_bound`:
    /// everything from the first file whose upper bound reaches the lower
    /// bound onwards.
    pub fn file_iterator(
        &self,
        lower_bound: Round,
        origin: Round,
    ) -> impl Iterator<Item = &PcesFile> + '_ {
        self.files
            .iter()
            .skip_while(move |file| file.upper_bound() < lower_bound)
            .filter(move |file| file.origin() == origin)
    }
}

/// Discover the event log files in `dir` and decide which origin to read.
///
/// 1. Every entry whose name parses is a candidate; anything else is
///    ignored.
/// 2. Sequence numbers must be contiguous. A missing number is fine if the
///    recycle bin holds it, or if `permit_gaps` is set.
/// 3. The origin is the greatest origin at or below `starting_round`.
///    Files with a later origin belong to a future the loaded state never
///    saw; they are recycled.
///
/// # Errors
///
/// Returns [`PcesError::SequenceGap`] on an unexplained gap, or
/// [`PcesError::Io`] if the directory cannot be read or a file cannot be
/// recycled.
pub fn read_files_from_disk(
    config: &LogConfig,
    dir: &Path,
    starting_round: Round,
) -> Result<PcesFileTracker, PcesError> {
    let mut tracker = PcesFileTracker::new(starting_round);
    if !dir.is_dir() {
        return Ok(tracker);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        match PcesFile::parse(&path) {
            Ok(file) => files.push(file),
            Err(err) => {
                if path.extension().is_some_and(|ext| ext == FILE_EXTENSION) {
                    warn!(path = %path.display(), error = %err, "ignoring misnamed event log file");
                } else {
                    debug!(path = %path.display(), "ignoring non-log entry");
                }
            }
        }
    }
    files.sort_by_key(PcesFile::sequence);

    let bin = RecycleBin::for_log(dir, &config.recycle_dir_name);
    check_sequence_gaps(&files, &bin, config.permit_gaps)?;

    let origin = files
        .iter()
        .map(PcesFile::origin)
        .filter(|&origin| origin <= starting_round)
        .max()
        .unwrap_or(starting_round);
    tracker.set_origin(origin);

    for file in files {
        tracker.next_sequence = tracker.next_sequence.max(file.sequence() + 1);
        if file.origin() > origin {
            let moved = bin.recycle(file.path())?;
            warn!(
                path = %file.path().display(),
                recycled_to = %moved.display(),
                file_origin = file.origin(),
                origin,
                "recycling event log file from an origin later than the starting round"
            );
            continue;
        }
        tracker.push(file);
    }

    debug!(
        dir = %dir.display(),
        files = tracker.len(),
        origin,
        next_sequence = tracker.next_sequence,
        "event log files discovered"
    );
    Ok(tracker)
}

fn check_sequence_gaps(
    files: &[PcesFile],
    bin: &RecycleBin,
    permit_gaps: bool,
) -> Result<(), PcesError> {
    let mut recycled = None;
    for pair in files.windows(2) {
        let expected = pair[0].sequence() + 1;
        let found = pair[1].sequence();
        if found == expected {
            continue;
        }
        if found < expected {
            return Err(PcesError::SequenceGap { expected, found });
        }
        if permit_gaps {
            warn!(expected, found, "permitting event log sequence gap");
            continue;
        }
        if recycled.is_none() {
            recycled = Some(bin.recycled_sequences()?);
        }
        let explained = recycled
            .as_ref()
            .is_some_and(|set| (expected..found).all(|seq| set.contains(&seq)));
        if !explained {
            return Err(PcesError::SequenceGap { expected, found });
        }
        debug!(expected, found, "sequence gap accounted for by recycle bin");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn touch(dir: &Path, seq: u64, lower: Round, upper: Round, origin: Round) -> PcesFile {
        let file = PcesFile::new(Utc::now(), seq, lower, upper, origin, dir);
        fs::write(file.path(), super::super::format::header()).expect("write");
        file
    }

    #[test]
    fn missing_dir_is_empty_at_starting_round() {
        let dir = TempDir::new().expect("tempdir");
        let tracker =
            read_files_from_disk(&LogConfig::default(), &dir.path().join("nope"), 7).expect("read");
        assert!(tracker.is_empty());
        assert_eq!(tracker.origin(), 7);
        assert_eq!(tracker.next_sequence(), 0);
    }

    #[test]
    fn files_are_sorted_and_foreign_entries_ignored() {
        let dir = TempDir::new().expect("tempdir");
        touch(dir.path(), 1, 5, 9, 0);
        touch(dir.path(), 0, 1, 6, 0);
        fs::write(dir.path().join("README"), b"hi").expect("write");
        fs::create_dir(dir.path().join("recycle")).expect("mkdir");

        let tracker = read_files_from_disk(&LogConfig::default(), dir.path(), 0).expect("read");
        let seqs: Vec<u64> = tracker.files().iter().map(PcesFile::sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(tracker.next_sequence(), 2);
    }

    #[test]
    fn unexplained_gap_is_an_error_unless_permitted() {
        let dir = TempDir::new().expect("tempdir");
        touch(dir.path(), 0, 1, 5, 0);
        touch(dir.path(), 2, 5, 9, 0);

        let err = read_files_from_disk(&LogConfig::default(), dir.path(), 0).expect_err("gap");
        assert!(matches!(err, PcesError::SequenceGap { expected: 1, found: 2 }));

        let config = LogConfig {
            permit_gaps: true,
            ..LogConfig::default()
        };
        assert_eq!(read_files_from_disk(&config, dir.path(), 0).expect("read").len(), 2);
    }

    #[test]
    fn gap_explained_by_recycle_bin_is_accepted() {
        let dir = TempDir::new().expect("tempdir");
        touch(dir.path(), 0, 1, 5, 0);
        let middle = touch(dir.path(), 1, 3, 7, 0);
        touch(dir.path(), 2, 5, 9, 0);
        RecycleBin::for_log(dir.path(), "recycle")
            .recycle(middle.path())
            .expect("recycle");

        let tracker = read_files_from_disk(&LogConfig::default(), dir.path(), 0).expect("read");
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn later_origins_are_recycled() {
        let dir = TempDir::new().expect("tempdir");
        touch(dir.path(), 0, 1, 5, 0);
        touch(dir.path(), 1, 10, 20, 10);
        let future = touch(dir.path(), 2, 30, 40, 30);

        let tracker = read_files_from_disk(&LogConfig::default(), dir.path(), 15).expect("read");
        assert_eq!(tracker.origin(), 10);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.next_sequence(), 3);
        assert!(!future.path().exists());
        assert!(dir.path().join("recycle").join(future.file_name()).exists());

        let origins: Vec<Round> = tracker.file_iterator(0, 10).map(PcesFile::origin).collect();
        assert_eq!(origins, vec![10]);
    }

    #[test]
    fn file_iterator_starts_at_first_reaching_file() {
        let mut tracker = PcesFileTracker::new(0);
        for (seq, lower, upper) in [(0, 1, 10), (1, 8, 20), (2, 18, 30)] {
            tracker.push(PcesFile::new(Utc::now(), seq, lower, upper, 0, Path::new(".")));
        }
        let seqs: Vec<u64> = tracker.file_iterator(15, 0).map(PcesFile::sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(tracker.file_iterator(31, 0).count(), 0);
    }

    #[test]
    fn remove_expired_keeps_sequence_counter() {
        let mut tracker = PcesFileTracker::new(0);
        for (seq, lower, upper) in [(0, 1, 10), (1, 8, 20)] {
            tracker.push(PcesFile::new(Utc::now(), seq, lower, upper, 0, Path::new(".")));
        }
        let expired = tracker.remove_expired(10);
        assert_eq!(expired.len(), 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.next_sequence(), 2);
    }
}
