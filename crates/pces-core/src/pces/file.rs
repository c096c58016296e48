//! Event log file descriptors and the file naming scheme.
//!
//! Everything the reader needs to order files and judge coverage is in the
//! name, so a directory listing is enough:
//!
//! ```text
//! <timestamp>_seq<sequence>_minr<lower>_maxr<upper>_orgn<origin>.pces
//! ```
//!
//! Numbers are zero-padded to ten digits. The timestamp is RFC 3339 UTC with
//! microseconds and `:` replaced by `+`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use super::PcesError;
use crate::event::Round;

/// Extension of event log files.
pub const FILE_EXTENSION: &str = "pces";

/// Immutable description of one event log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcesFile {
    timestamp: DateTime<Utc>,
    sequence: u64,
    lower_bound: Round,
    upper_bound: Round,
    origin: Round,
    path: PathBuf,
}

impl PcesFile {
    /// Describe a file in `dir`. The path is derived from the other fields.
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        sequence: u64,
        lower_bound: Round,
        upper_bound: Round,
        origin: Round,
        dir: &Path,
    ) -> Self {
        let mut file = Self {
            timestamp,
            sequence,
            lower_bound,
            upper_bound,
            origin,
            path: PathBuf::new(),
        };
        file.path = dir.join(file.file_name());
        file
    }

    /// Parse a descriptor from a path's file name.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::InvalidFileName`] if the name does not follow the
    /// scheme.
    pub fn parse(path: &Path) -> Result<Self, PcesError> {
        let invalid = || PcesError::InvalidFileName(path.display().to_string());

        let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
        let stem = name
            .strip_suffix(FILE_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;

        let mut parts = stem.split('_');
        let (Some(ts), Some(seq), Some(minr), Some(maxr), Some(orgn), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };

        let number = |part: &str, prefix: &str| -> Result<u64, PcesError> {
            part.strip_prefix(prefix)
                .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(invalid)
        };

        let timestamp = DateTime::parse_from_rfc3339(&ts.replace('+', ":"))
            .map_err(|_| invalid())?
            .with_timezone(&Utc);
        let lower_bound = number(minr, "minr")?;
        let upper_bound = number(maxr, "maxr")?;
        if lower_bound > upper_bound {
            return Err(invalid());
        }

        Ok(Self {
            timestamp,
            sequence: number(seq, "seq")?,
            lower_bound,
            upper_bound,
            origin: number(orgn, "orgn")?,
            path: path.to_path_buf(),
        })
    }

    /// File name encoding every field of this descriptor.
    #[must_use]
    pub fn file_name(&self) -> String {
        let ts = self
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .replace(':', "+");
        format!(
            "{ts}_seq{:010}_minr{:010}_maxr{:010}_orgn{:010}.{FILE_EXTENSION}",
            self.sequence, self.lower_bound, self.upper_bound, self.origin
        )
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub const fn lower_bound(&self) -> Round {
        self.lower_bound
    }

    #[must_use]
    pub const fn upper_bound(&self) -> Round {
        self.upper_bound
    }

    #[must_use]
    pub const fn origin(&self) -> Round {
        self.origin
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an event of `birth_round` may be stored in this file.
    #[must_use]
    pub const fn can_contain(&self, birth_round: Round) -> bool {
        birth_round >= self.lower_bound && birth_round <= self.upper_bound
    }

    /// Same descriptor at a different location, e.g. after recycling.
    #[must_use]
    pub fn relocated(&self, path: PathBuf) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }
}

impl fmt::Display for PcesFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq {} rounds [{}, {}] origin {}",
            self.sequence, self.lower_bound, self.upper_bound, self.origin
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 123_456_000)
            .single()
            .expect("ts")
    }

    #[test]
    fn name_encodes_all_fields() {
        let file = PcesFile::new(ts(), 7, 12, 340, 3, Path::new("/log"));
        assert_eq!(
            file.file_name(),
            "2023-11-14T22+13+20.123456Z_seq0000000007_minr0000000012_maxr0000000340_orgn0000000003.pces"
        );
        assert_eq!(file.path(), Path::new("/log").join(file.file_name()));
    }

    #[test]
    fn parse_inverts_file_name() {
        let file = PcesFile::new(ts(), 42, 1, u64::MAX, 0, Path::new("/log"));
        assert_eq!(PcesFile::parse(file.path()).expect("parse"), file);
    }

    #[test]
    fn parse_rejects_foreign_names() {
        for name in [
            ".pces.lock",
            "notes.txt",
            "x_seq1_minr1_maxr2_orgn0.pces",
            "2023-11-14T22+13+20.123456Z_seq1_minr3_maxr2_orgn0.pces",
            "2023-11-14T22+13+20.123456Z_seq1_minr1_maxr2.pces",
            "2023-11-14T22+13+20.123456Z_seq-1_minr1_maxr2_orgn0.pces",
            "2023-11-14T22+13+20.123456Z_seq1_minr1_maxr2_orgn0_extra.pces",
        ] {
            assert!(PcesFile::parse(Path::new(name)).is_err(), "{name} parsed");
        }
    }

    #[test]
    fn can_contain_is_inclusive() {
        let file = PcesFile::new(ts(), 0, 5, 9, 0, Path::new("."));
        assert!(!file.can_contain(4));
        assert!(file.can_contain(5));
        assert!(file.can_contain(9));
        assert!(!file.can_contain(10));
    }
}
