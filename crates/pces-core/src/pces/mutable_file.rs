use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use super::PcesError;
use super::file::PcesFile;
use super::format::{HEADER_LEN, encode_frame, header};
use crate::event::{EventCodec, GossipEvent, Round};

/// The single event log file currently open for append.
#[derive(Debug)]
pub struct PcesMutableFile {
    descriptor: PcesFile,
    out: BufWriter<File>,
    codec: EventCodec,
    size: u64,
    highest_round: Option<Round>,
    frame: Vec<u8>,
}

impl PcesMutableFile {
    /// Create the file on disk and write its header.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if the file already exists or cannot be
    /// written.
    pub fn create(descriptor: PcesFile, codec: EventCodec) -> Result<Self, PcesError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(descriptor.path())?;
        let mut out = BufWriter::new(file);
        out.write_all(&header())?;
        out.flush()?;
        out.get_ref().sync_all()?;
        sync_parent_dir(&descriptor)?;

        Ok(Self {
            descriptor,
            out,
            codec,
            size: HEADER_LEN as u64,
            highest_round: None,
            frame: Vec::new(),
        })
    }

    #[must_use]
    pub const fn descriptor(&self) -> &PcesFile {
        &self.descriptor
    }

    /// Whether `birth_round` is within the declared bounds.
    #[must_use]
    pub const fn can_contain(&self, birth_round: Round) -> bool {
        self.descriptor.can_contain(birth_round)
    }

    /// Append one event. Buffered until [`sync`](Self::sync).
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::OutOfBounds`] if the event does not belong here,
    /// [`PcesError::Encode`] if it is too large, or [`PcesError::Io`] on
    /// write failure.
    pub fn write_event(&mut self, event: &GossipEvent) -> Result<(), PcesError> {
        let round = event.birth_round();
        if !self.descriptor.can_contain(round) {
            return Err(PcesError::OutOfBounds {
                path: self.descriptor.path().to_path_buf(),
                birth_round: round,
                lower: self.descriptor.lower_bound(),
                upper: self.descriptor.upper_bound(),
            });
        }

        let payload = self.codec.encode(event)?;
        self.frame.clear();
        encode_frame(&payload, &mut self.frame);
        self.out.write_all(&self.frame)?;

        self.size += self.frame.len() as u64;
        self.highest_round = Some(self.highest_round.map_or(round, |highest| highest.max(round)));
        Ok(())
    }

    /// Flush buffered frames and fsync the file data.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if either step fails.
    pub fn sync(&mut self) -> Result<(), PcesError> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }

    /// Sync and close. Returns the descriptor for the tracker.
    ///
    /// # Errors
    ///
    /// Returns [`PcesError::Io`] if the final sync fails.
    pub fn close(mut self) -> Result<PcesFile, PcesError> {
        self.sync()?;
        Ok(self.descriptor)
    }

    /// Bytes written, including the header.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Rounds actually used: highest written round minus the lower bound.
    #[must_use]
    pub fn utilized_span(&self) -> u64 {
        self.highest_round
            .map_or(0, |highest| highest - self.descriptor.lower_bound())
    }
}

/// Make a newly created directory entry durable.
#[cfg(unix)]
fn sync_parent_dir(descriptor: &PcesFile) -> Result<(), PcesError> {
    if let Some(parent) = descriptor.path().parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_descriptor: &PcesFile) -> Result<(), PcesError> {
    Ok(())
}
