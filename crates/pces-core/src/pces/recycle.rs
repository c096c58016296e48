use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::file::PcesFile;

/// Holding area for event log files that are no longer read: corrupt files,
/// files from an abandoned origin, and expired files.
#[derive(Debug, Clone)]
pub struct RecycleBin {
    dir: PathBuf,
}

impl RecycleBin {
    /// Recycle bin inside `log_dir`.
    #[must_use]
    pub fn for_log(log_dir: &Path, name: &str) -> Self {
        Self {
            dir: log_dir.join(name),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move `path` into the bin. Returns the new location. An existing file
    /// of the same name is never overwritten; a numeric suffix is added.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the bin cannot be created or the rename fails.
    pub fn recycle(&self, path: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let name = path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "recycled path has no file name")
        })?;

        let mut target = self.dir.join(name);
        let mut attempt = 1u32;
        while target.exists() {
            let mut suffixed = name.to_os_string();
            suffixed.push(format!(".{attempt}"));
            target = self.dir.join(suffixed);
            attempt += 1;
        }

        fs::rename(path, &target)?;
        Ok(target)
    }

    /// Sequence numbers of every event log file in the bin.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the bin exists but cannot be listed.
    pub fn recycled_sequences(&self) -> io::Result<BTreeSet<u64>> {
        let mut out = BTreeSet::new();
        if !self.dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Ok(file) = PcesFile::parse(&path) {
                out.insert(file.sequence());
            }
        }
        Ok(out)
    }
}
