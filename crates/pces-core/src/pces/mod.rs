//! Preconsensus event stream: the durable, file-rotated event log.
//!
//! # Directory Layout
//!
//! ```text
//! <log dir>/
//!   2026-03-01T10+15+02.000123Z_seq0000000000_minr0000000001_maxr0000000201_orgn0000000000.pces
//!   2026-03-01T10+21+40.481516Z_seq0000000001_minr0000000012_maxr0000000030_orgn0000000000.pces
//!   .pces.lock            # advisory lock held by the writer
//!   recycle/              # files moved aside after corruption or expiry
//! ```
//!
//! # Invariants
//!
//! - Sequence numbers increase by one per file; a missing number must be
//!   accounted for by the recycle bin unless gaps are permitted.
//! - Every event in a file lies within the file's declared round bounds, and
//!   rounds never decrease within a file.
//! - Only the newest file is ever open for append. Closed files are never
//!   modified again, except that a torn final frame left by a crash is cut
//!   off on the next startup.
//! - Nothing is deleted: corrupt and expired files go to the recycle bin.

pub mod file;
pub mod format;
pub mod mutable_file;
pub mod reader;
pub mod recovery;
pub mod recycle;
pub mod tracker;
pub mod worker;
pub mod writer;

pub use file::PcesFile;
pub use mutable_file::PcesMutableFile;
pub use reader::{PcesEventIterator, PcesReader};
pub use recovery::{RecoveryReport, RecycledFile};
pub use recycle::RecycleBin;
pub use tracker::{PcesFileTracker, read_files_from_disk};
pub use worker::{DurableLogWorker, LogCommand, WorkerReport};
pub use writer::PcesWriter;

use std::io;
use std::path::PathBuf;

use crate::error::ErrorCode;
use crate::event::{CodecError, Round};
use crate::lock::LockError;
use crate::window::WindowError;

/// Errors from writing, reading or recovering the event log.
#[derive(Debug, thiserror::Error)]
pub enum PcesError {
    /// I/O failure. Fatal while appending: the node cannot proceed without
    /// durable history.
    #[error("event log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event log lock error: {0}")]
    Lock(#[from] LockError),

    #[error("cannot encode event: {0}")]
    Encode(#[from] CodecError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error("birth round {birth_round} outside bounds [{lower}, {upper}] of {}", path.display())]
    OutOfBounds {
        path: PathBuf,
        birth_round: Round,
        lower: Round,
        upper: Round,
    },

    #[error("invalid event log file name: {0}")]
    InvalidFileName(String),

    #[error("event log sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("corrupt event log file {} at offset {offset}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error(
        "rounds {from}..={to} were only covered by recycled file {}; history is incomplete",
        path.display()
    )]
    UncoveredRange { from: Round, to: Round, path: PathBuf },

    #[error("event log worker has stopped")]
    WorkerStopped,

    #[error("event log worker panicked")]
    WorkerPanicked,
}

impl PcesError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io(_) | Self::Lock(LockError::IoError(_)) => ErrorCode::LogWriteFailed,
            Self::Lock(LockError::Timeout { .. }) => ErrorCode::LockContention,
            Self::Encode(err) => err.code(),
            Self::Window(err) => err.code(),
            Self::OutOfBounds { .. } => ErrorCode::LogOutOfBounds,
            Self::InvalidFileName(_) => ErrorCode::InvalidLogFileName,
            Self::SequenceGap { .. } => ErrorCode::LogSequenceGap,
            Self::Corrupt { .. } => ErrorCode::CorruptLogFile,
            Self::UncoveredRange { .. } => ErrorCode::UncoveredRange,
            Self::WorkerStopped => ErrorCode::LogWorkerStopped,
            Self::WorkerPanicked => ErrorCode::InternalUnexpected,
        }
    }

    /// True when the node must halt rather than continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Lock(_)
                | Self::SequenceGap { .. }
                | Self::Corrupt { .. }
                | Self::UncoveredRange { .. }
                | Self::WorkerStopped
                | Self::WorkerPanicked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_failures_are_fatal() {
        let io = PcesError::Io(io::Error::other("disk full"));
        assert!(io.is_fatal());
        assert_eq!(io.code(), ErrorCode::LogWriteFailed);

        let uncovered = PcesError::UncoveredRange {
            from: 3,
            to: 9,
            path: PathBuf::from("x.pces"),
        };
        assert!(uncovered.is_fatal());
        assert!(uncovered.to_string().contains("3..=9"));
    }

    #[test]
    fn regression_is_not_fatal() {
        let err = PcesError::from(WindowError::Regression {
            current: 5,
            proposed: 4,
        });
        assert!(!err.is_fatal());
        assert_eq!(err.code(), ErrorCode::WindowRegression);
    }
}
