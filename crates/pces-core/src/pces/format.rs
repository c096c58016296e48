//! Byte layout of an event log file.
//!
//! ```text
//! header   "PCES" version:u8 reserved:[u8;3]
//! frame*   len:u32 LE  crc32(payload):u32 LE  payload:[u8; len]
//! ```
//!
//! A frame cut short by end of file is *torn*: the signature of a crash in
//! the middle of an append. Every event encodes to a non-empty payload, so a
//! zero-length frame is never written; one read back is zero fill.

use std::io::{self, Read};

/// File magic.
pub const MAGIC: &[u8; 4] = b"PCES";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// Length of the file header.
pub const HEADER_LEN: usize = 8;

/// Length of a frame header (length + checksum).
pub const FRAME_HEADER_LEN: usize = 8;

/// Header bytes for a new file.
#[must_use]
pub const fn header() -> [u8; HEADER_LEN] {
    [
        MAGIC[0],
        MAGIC[1],
        MAGIC[2],
        MAGIC[3],
        FORMAT_VERSION,
        0,
        0,
        0,
    ]
}

/// Append one frame carrying `payload` to `out`.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Problems found while reading frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("bad file magic")]
    BadMagic,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),

    #[error("file ends inside a frame starting at offset {offset}")]
    Torn { offset: u64 },

    #[error("checksum mismatch in frame at offset {offset}")]
    ChecksumMismatch { offset: u64, frame_end: u64 },

    #[error("empty frame at offset {offset}")]
    EmptyFrame { offset: u64 },

    #[error("frame at offset {offset} declares {len} bytes, limit is {max}")]
    FrameTooLarge { offset: u64, len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Offset of the frame (or header) at fault, if known.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        match self {
            Self::BadMagic | Self::UnsupportedVersion(_) | Self::Io(_) => 0,
            Self::Torn { offset }
            | Self::ChecksumMismatch { offset, .. }
            | Self::EmptyFrame { offset }
            | Self::FrameTooLarge { offset, .. } => *offset,
        }
    }
}

/// Sequential frame reader over any byte source.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    offset: u64,
    max_frame_len: usize,
}

impl<R: Read> FrameReader<R> {
    /// Read and check the file header.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BadMagic`] or [`FrameError::UnsupportedVersion`]
    /// for a foreign or future file, [`FrameError::Torn`] if the header
    /// itself is incomplete.
    pub fn new(mut inner: R, max_frame_len: usize) -> Result<Self, FrameError> {
        let mut head = [0u8; HEADER_LEN];
        let got = read_full(&mut inner, &mut head)?;
        if got < HEADER_LEN {
            let checked = got.min(MAGIC.len());
            if head[..checked] != MAGIC[..checked] {
                return Err(FrameError::BadMagic);
            }
            return Err(FrameError::Torn { offset: 0 });
        }
        if &head[..4] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        if head[4] != FORMAT_VERSION {
            return Err(FrameError::UnsupportedVersion(head[4]));
        }
        Ok(Self {
            inner,
            offset: HEADER_LEN as u64,
            max_frame_len,
        })
    }

    /// Offset just past the last complete frame returned.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Next payload, or `None` at a clean end of file.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for a torn, empty, oversized or corrupt
    /// frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let start = self.offset;

        let mut head = [0u8; FRAME_HEADER_LEN];
        match read_full(&mut self.inner, &mut head)? {
            0 => return Ok(None),
            n if n < FRAME_HEADER_LEN => return Err(FrameError::Torn { offset: start }),
            _ => {}
        }

        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let crc = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if len == 0 {
            return Err(FrameError::EmptyFrame { offset: start });
        }
        if len > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                offset: start,
                len,
                max: self.max_frame_len,
            });
        }

        let mut payload = vec![0u8; len];
        if read_full(&mut self.inner, &mut payload)? < len {
            return Err(FrameError::Torn { offset: start });
        }

        let frame_end = start + (FRAME_HEADER_LEN + len) as u64;
        if crc32fast::hash(&payload) != crc {
            return Err(FrameError::ChecksumMismatch {
                offset: start,
                frame_end,
            });
        }

        self.offset = frame_end;
        Ok(Some(payload))
    }
}

/// Fill `buf` as far as the source allows. Returns the bytes read; fewer
/// than `buf.len()` means end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(payloads: &[&[u8]]) -> Vec<u8> {
        let mut bytes = header().to_vec();
        for payload in payloads {
            encode_frame(payload, &mut bytes);
        }
        bytes
    }

    fn frames(bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
        let mut reader = FrameReader::new(bytes, 1024)?;
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame()? {
            out.push(frame);
        }
        Ok(out)
    }

    #[test]
    fn frames_read_back_in_order() {
        let bytes = file_with(&[b"one", b"two", b"three"]);
        let read = frames(&bytes).expect("frames");
        assert_eq!(read, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn header_only_file_is_empty() {
        assert!(frames(&header()).expect("frames").is_empty());
    }

    #[test]
    fn foreign_files_are_rejected() {
        assert!(matches!(frames(b"JSONxxxx"), Err(FrameError::BadMagic)));
        let mut bytes = header();
        bytes[4] = 9;
        assert!(matches!(
            frames(&bytes),
            Err(FrameError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_header_is_torn() {
        assert!(matches!(frames(b"PCE"), Err(FrameError::Torn { offset: 0 })));
        assert!(matches!(frames(b""), Err(FrameError::Torn { offset: 0 })));
    }

    #[test]
    fn cut_frame_is_torn_at_its_start() {
        let bytes = file_with(&[b"first", b"second"]);
        let second_start = (HEADER_LEN + FRAME_HEADER_LEN + 5) as u64;
        for cut in (second_start as usize + 1)..bytes.len() {
            let err = frames(&bytes[..cut]).expect_err("torn");
            assert!(
                matches!(err, FrameError::Torn { offset } if offset == second_start),
                "cut {cut}: {err}"
            );
        }
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut bytes = file_with(&[b"payload"]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            frames(&bytes),
            Err(FrameError::ChecksumMismatch { offset: 8, .. })
        ));
    }

    #[test]
    fn zero_fill_is_an_empty_frame() {
        let mut bytes = file_with(&[b"kept"]);
        let start = bytes.len() as u64;
        bytes.extend_from_slice(&[0; 32]);
        let mut reader = FrameReader::new(bytes.as_slice(), 1024).expect("header");
        assert_eq!(reader.next_frame().expect("first"), Some(b"kept".to_vec()));
        assert!(matches!(
            reader.next_frame(),
            Err(FrameError::EmptyFrame { offset }) if offset == start
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut bytes = header().to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            frames(&bytes),
            Err(FrameError::FrameTooLarge { offset: 8, .. })
        ));
    }
}
