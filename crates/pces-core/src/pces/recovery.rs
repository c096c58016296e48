//! Startup validation of event log files.
//!
//! Before any event is replayed, every file the replay will touch is scanned
//! frame by frame without keeping events in memory.
//!
//! - **Torn tail**: the newest file ends inside its last frame, its last
//!   frame fails the checksum or does not decode, or it ends in zero fill.
//!   This is what a crash mid-append leaves behind. The file is truncated to
//!   its last complete frame.
//! - **Corrupt**: anything else (bad header, checksum failure mid-file,
//!   undecodable payload, round outside the declared bounds, torn frame in
//!   an older file). The file is moved to the recycle bin.
//!
//! Every round a damaged file declared (at or above the replay lower bound)
//! must still be declared by some surviving file. Otherwise the history
//! handed to consensus would have a hole, and startup fails before anything
//! on disk is touched, so every later start fails the same way.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use super::PcesError;
use super::file::PcesFile;
use super::format::{FrameError, FrameReader, HEADER_LEN};
use super::recycle::RecycleBin;
use crate::event::{EventCodec, Round};

/// Outcome of scanning one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileHealth {
    Intact {
        events: u64,
    },
    /// Valid up to `valid_len` bytes; the rest is a partial final frame.
    TornTail {
        events: u64,
        valid_len: u64,
        file_len: u64,
    },
    Corrupt {
        offset: u64,
        reason: String,
    },
}

/// A file moved aside during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecycledFile {
    pub file: PcesFile,
    pub recycled_to: PathBuf,
    pub reason: String,
}

/// What startup recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub files_scanned: usize,
    pub events_found: u64,
    /// Files cut back to their last complete frame, with bytes removed.
    pub truncated: Vec<(PathBuf, u64)>,
    pub recycled: Vec<RecycledFile>,
}

impl RecoveryReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.truncated.is_empty() && self.recycled.is_empty()
    }
}

/// Scan `file` without retaining events.
///
/// # Errors
///
/// Returns an I/O error only if the file cannot be opened or stat'ed;
/// malformed content is reported through [`FileHealth`].
pub fn scan_file(file: &PcesFile, codec: &EventCodec) -> std::io::Result<FileHealth> {
    let handle = File::open(file.path())?;
    let file_len = handle.metadata()?.len();

    let mut reader = match FrameReader::new(BufReader::new(handle), codec.max_event_bytes()) {
        Ok(reader) => reader,
        Err(FrameError::Io(err)) => return Err(err),
        Err(FrameError::Torn { .. }) => {
            return Ok(FileHealth::TornTail {
                events: 0,
                valid_len: 0,
                file_len,
            });
        }
        Err(err) => {
            return Ok(FileHealth::Corrupt {
                offset: 0,
                reason: err.to_string(),
            });
        }
    };

    let mut events = 0u64;
    loop {
        let offset = reader.offset();
        let payload = match reader.next_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) => return Ok(FileHealth::Intact { events }),
            Err(FrameError::Io(err)) => return Err(err),
            Err(FrameError::Torn { .. }) => {
                return Ok(FileHealth::TornTail {
                    events,
                    valid_len: offset,
                    file_len,
                });
            }
            Err(FrameError::ChecksumMismatch { frame_end, .. }) if frame_end == file_len => {
                return Ok(FileHealth::TornTail {
                    events,
                    valid_len: offset,
                    file_len,
                });
            }
            Err(FrameError::EmptyFrame { offset }) if zero_filled_from(file.path(), offset)? => {
                return Ok(FileHealth::TornTail {
                    events,
                    valid_len: offset,
                    file_len,
                });
            }
            Err(err) => {
                return Ok(FileHealth::Corrupt {
                    offset: err.offset(),
                    reason: err.to_string(),
                });
            }
        };

        let event = match codec.decode(&payload) {
            Ok(event) => event,
            Err(_) if reader.offset() == file_len => {
                return Ok(FileHealth::TornTail {
                    events,
                    valid_len: offset,
                    file_len,
                });
            }
            Err(err) => {
                return Ok(FileHealth::Corrupt {
                    offset,
                    reason: format!("undecodable event: {err}"),
                });
            }
        };

        let round = event.birth_round();
        if !file.can_contain(round) {
            return Ok(FileHealth::Corrupt {
                offset,
                reason: format!(
                    "birth round {round} outside declared bounds [{}, {}]",
                    file.lower_bound(),
                    file.upper_bound()
                ),
            });
        }
        events += 1;
    }
}

/// Whether everything from `offset` to the end of the file is zero.
fn zero_filled_from(path: &Path, offset: u64) -> io::Result<bool> {
    let mut handle = File::open(path)?;
    handle.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; 4096];
    loop {
        let read = handle.read(&mut buf)?;
        if read == 0 {
            return Ok(true);
        }
        if buf[..read].iter().any(|&byte| byte != 0) {
            return Ok(false);
        }
    }
}

/// Cut `file` back to `valid_len` bytes. A file torn inside its header is
/// rewritten as an empty, valid file.
fn truncate_torn_tail(file: &PcesFile, valid_len: u64) -> Result<(), PcesError> {
    if valid_len < HEADER_LEN as u64 {
        fs::write(file.path(), super::format::header())?;
    } else {
        let handle = OpenOptions::new().write(true).open(file.path())?;
        handle.set_len(valid_len)?;
        handle.sync_all()?;
    }
    Ok(())
}

/// Files that survived recovery, plus what was done.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub survivors: Vec<PcesFile>,
    pub report: RecoveryReport,
}

/// What recovery decided for one damaged file.
enum Repair {
    Truncate {
        file: PcesFile,
        events: u64,
        valid_len: u64,
        file_len: u64,
    },
    Recycle {
        file: PcesFile,
        reason: String,
    },
}

/// Scan `candidates`, verify that the surviving files still cover every
/// round from `lower_bound` that a damaged file declared, then repair a torn
/// tail in the newest file and recycle the rest of the damaged files.
///
/// `newest_sequence` is the sequence of the newest file in the whole
/// directory: only that file may legitimately have a torn tail.
///
/// Nothing on disk changes unless the coverage check passes.
pub(crate) fn recover_files(
    candidates: Vec<PcesFile>,
    newest_sequence: Option<u64>,
    lower_bound: Round,
    bin: &RecycleBin,
    codec: &EventCodec,
) -> Result<Recovered, PcesError> {
    let mut report = RecoveryReport::default();
    let mut survivors = Vec::with_capacity(candidates.len());
    let mut repairs = Vec::new();

    for file in candidates {
        report.files_scanned += 1;
        let health = scan_file(&file, codec)?;
        let is_newest = newest_sequence == Some(file.sequence());

        match health {
            FileHealth::Intact { events } => {
                report.events_found += events;
                survivors.push(file);
            }
            FileHealth::TornTail {
                events,
                valid_len,
                file_len,
            } if is_newest => {
                survivors.push(file.clone());
                repairs.push(Repair::Truncate {
                    file,
                    events,
                    valid_len,
                    file_len,
                });
            }
            FileHealth::TornTail { valid_len, .. } => repairs.push(Repair::Recycle {
                file,
                reason: format!(
                    "torn frame at offset {valid_len} in a file that was already closed"
                ),
            }),
            FileHealth::Corrupt { offset, reason } => repairs.push(Repair::Recycle {
                file,
                reason: format!("offset {offset}: {reason}"),
            }),
        }
    }

    for repair in &repairs {
        if let Repair::Recycle { file, .. } = repair {
            check_coverage(file, &survivors, lower_bound)?;
        }
    }

    for repair in repairs {
        match repair {
            Repair::Truncate {
                file,
                events,
                valid_len,
                file_len,
            } => {
                truncate_torn_tail(&file, valid_len)?;
                let removed = file_len.saturating_sub(valid_len.max(HEADER_LEN as u64));
                warn!(
                    path = %file.path().display(),
                    bytes_removed = removed,
                    events_preserved = events,
                    "torn write repaired: truncated incomplete trailing frame"
                );
                report.events_found += events;
                report.truncated.push((file.path().to_path_buf(), removed));
            }
            Repair::Recycle { file, reason } => {
                let recycled_to = bin.recycle(file.path())?;
                warn!(
                    path = %file.path().display(),
                    recycled_to = %recycled_to.display(),
                    sequence = file.sequence(),
                    lower_bound = file.lower_bound(),
                    upper_bound = file.upper_bound(),
                    reason = %reason,
                    "corrupt event log file moved to recycle bin"
                );
                report.recycled.push(RecycledFile {
                    file,
                    recycled_to,
                    reason,
                });
            }
        }
    }

    debug!(
        files_scanned = report.files_scanned,
        events_found = report.events_found,
        truncated = report.truncated.len(),
        recycled = report.recycled.len(),
        "event log recovery scan complete"
    );
    Ok(Recovered { survivors, report })
}

/// Ensure every round `recycled` declared at or above `lower_bound` is
/// declared by at least one of `survivors`.
///
/// # Errors
///
/// Returns [`PcesError::UncoveredRange`] naming the first uncovered stretch.
pub fn check_coverage(
    recycled: &PcesFile,
    survivors: &[PcesFile],
    lower_bound: Round,
) -> Result<(), PcesError> {
    if recycled.upper_bound() < lower_bound {
        return Ok(());
    }
    let start = recycled.lower_bound().max(lower_bound);
    let end = recycled.upper_bound();

    let mut intervals: Vec<(Round, Round)> = survivors
        .iter()
        .filter(|file| file.origin() == recycled.origin())
        .map(|file| (file.lower_bound(), file.upper_bound()))
        .collect();
    intervals.sort_unstable();

    let mut cursor = start;
    for (lower, upper) in intervals {
        if lower > cursor {
            break;
        }
        if upper >= cursor {
            if upper >= end {
                return Ok(());
            }
            cursor = upper + 1;
        }
    }

    error!(
        path = %recycled.path().display(),
        from = cursor,
        to = end,
        "recycled event log file leaves required rounds uncovered"
    );
    Err(PcesError::UncoveredRange {
        from: cursor,
        to: end,
        path: recycled.path().to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCore, GossipEvent, NodeId, Signature};
    use crate::pces::format::{encode_frame, header};
    use chrono::Utc;
    use tempfile::TempDir;

    fn codec() -> EventCodec {
        EventCodec::new(4096)
    }

    fn event(round: Round) -> GossipEvent {
        GossipEvent::new(
            EventCore {
                creator: NodeId(2),
                birth_round: round,
                time_created: Utc::now(),
            },
            Vec::new(),
            vec![vec![round as u8 | 1]],
            Signature(vec![1; 4]),
        )
    }

    fn write_file(dir: &Path, seq: u64, lower: Round, upper: Round, rounds: &[Round]) -> PcesFile {
        let file = PcesFile::new(Utc::now(), seq, lower, upper, 0, dir);
        let mut bytes = header().to_vec();
        for &round in rounds {
            encode_frame(&codec().encode(&event(round)).expect("encode"), &mut bytes);
        }
        fs::write(file.path(), bytes).expect("write");
        file
    }

    fn described(seq: u64, lower: Round, upper: Round) -> PcesFile {
        PcesFile::new(Utc::now(), seq, lower, upper, 0, Path::new("."))
    }

    #[test]
    fn intact_file_counts_events() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 1, 10, &[1, 2, 2, 9]);
        assert_eq!(
            scan_file(&file, &codec()).expect("scan"),
            FileHealth::Intact { events: 4 }
        );
    }

    #[test]
    fn cut_final_frame_is_torn_tail() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 1, 10, &[1, 2]);
        let full = fs::metadata(file.path()).expect("meta").len();
        let handle = OpenOptions::new().write(true).open(file.path()).expect("open");
        handle.set_len(full - 3).expect("truncate");

        let health = scan_file(&file, &codec()).expect("scan");
        assert!(matches!(health, FileHealth::TornTail { events: 1, .. }));
    }

    #[test]
    fn out_of_bounds_round_is_corrupt() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 5, 10, &[5, 11]);
        assert!(matches!(
            scan_file(&file, &codec()).expect("scan"),
            FileHealth::Corrupt { .. }
        ));
    }

    #[test]
    fn release_order_rounds_within_bounds_are_intact() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 1, 10, &[4, 3, 4]);
        assert_eq!(
            scan_file(&file, &codec()).expect("scan"),
            FileHealth::Intact { events: 3 }
        );
    }

    #[test]
    fn zero_filled_tail_is_torn_tail() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 1, 10, &[1, 2]);
        let valid_len = fs::metadata(file.path()).expect("meta").len();
        let mut bytes = fs::read(file.path()).expect("read");
        bytes.extend_from_slice(&[0; 64]);
        fs::write(file.path(), &bytes).expect("write");

        assert_eq!(
            scan_file(&file, &codec()).expect("scan"),
            FileHealth::TornTail {
                events: 2,
                valid_len,
                file_len: valid_len + 64,
            }
        );
    }

    #[test]
    fn empty_frame_followed_by_data_is_corrupt() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 1, 10, &[1]);
        let mut bytes = fs::read(file.path()).expect("read");
        bytes.extend_from_slice(&[0; 8]);
        encode_frame(&codec().encode(&event(2)).expect("encode"), &mut bytes);
        fs::write(file.path(), &bytes).expect("write");

        assert!(matches!(
            scan_file(&file, &codec()).expect("scan"),
            FileHealth::Corrupt { .. }
        ));
    }

    #[test]
    fn undecodable_final_frame_is_torn_tail() {
        let dir = TempDir::new().expect("tempdir");
        let file = write_file(dir.path(), 0, 1, 10, &[1]);
        let valid_len = fs::metadata(file.path()).expect("meta").len();
        let mut bytes = fs::read(file.path()).expect("read");
        encode_frame(&[0xff; 3], &mut bytes);
        fs::write(file.path(), &bytes).expect("write");

        assert!(matches!(
            scan_file(&file, &codec()).expect("scan"),
            FileHealth::TornTail { events: 1, valid_len: v, .. } if v == valid_len
        ));
    }

    #[test]
    fn newest_file_is_repaired_older_file_is_recycled() {
        let dir = TempDir::new().expect("tempdir");
        let bin = RecycleBin::for_log(dir.path(), "recycle");
        let older = write_file(dir.path(), 0, 1, 10, &[1, 2]);
        let newest = write_file(dir.path(), 1, 1, 10, &[3, 4]);
        for file in [&older, &newest] {
            let len = fs::metadata(file.path()).expect("meta").len();
            let handle = OpenOptions::new().write(true).open(file.path()).expect("open");
            handle.set_len(len - 2).expect("truncate");
        }

        let recovered = recover_files(vec![older.clone(), newest.clone()], Some(1), 1, &bin, &codec())
            .expect("survivor declares the recycled range");

        assert_eq!(recovered.survivors, vec![newest.clone()]);
        assert_eq!(recovered.report.truncated.len(), 1);
        assert_eq!(recovered.report.recycled.len(), 1);
        assert_eq!(recovered.report.recycled[0].file, older);
        assert!(!older.path().exists());
        assert_eq!(
            scan_file(&newest, &codec()).expect("scan"),
            FileHealth::Intact { events: 1 }
        );
    }

    #[test]
    fn recycling_without_cover_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let bin = RecycleBin::for_log(dir.path(), "recycle");
        let first = write_file(dir.path(), 0, 1, 5, &[1, 2]);
        let broken = write_file(dir.path(), 1, 5, 10, &[5, 6]);
        let last = write_file(dir.path(), 2, 8, 20, &[8, 9]);
        let mut bytes = fs::read(broken.path()).expect("read");
        bytes[HEADER_LEN + 9] ^= 0xff;
        fs::write(broken.path(), bytes).expect("write");

        let candidates = vec![first, broken.clone(), last];
        for attempt in 0..2 {
            let err = recover_files(candidates.clone(), Some(2), 1, &bin, &codec())
                .expect_err("rounds 6 and 7 are lost");
            assert!(
                matches!(err, PcesError::UncoveredRange { from: 6, to: 10, .. }),
                "attempt {attempt}: {err}"
            );
            assert!(broken.path().exists(), "attempt {attempt}: nothing is recycled");
        }
    }

    #[test]
    fn coverage_accepts_overlapping_survivors() {
        let recycled = described(1, 10, 20);
        let survivors = [described(0, 1, 12), described(2, 13, 25)];
        assert!(check_coverage(&recycled, &survivors, 0).is_ok());
    }

    #[test]
    fn coverage_reports_first_hole() {
        let recycled = described(1, 10, 20);
        let survivors = [described(0, 1, 12), described(2, 16, 25)];
        let err = check_coverage(&recycled, &survivors, 0).expect_err("hole");
        assert!(matches!(
            err,
            PcesError::UncoveredRange { from: 13, to: 20, .. }
        ));
    }

    #[test]
    fn coverage_ignores_rounds_below_lower_bound() {
        let recycled = described(1, 10, 20);
        let survivors = [described(2, 16, 25)];
        assert!(check_coverage(&recycled, &survivors, 16).is_ok());
        assert!(check_coverage(&recycled, &survivors, 15).is_err());
        assert!(check_coverage(&described(0, 1, 5), &[], 6).is_ok());
    }
}
