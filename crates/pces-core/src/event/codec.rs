//! Binary encoding of [`GossipEvent`] for the durable log.
//!
//! The payload is self-describing only through its field order; framing
//! (length prefix and checksum) is the log file's job.
//!
//! ```text
//! creator        varint
//! birth_round    varint
//! secs           zigzag varint
//! nanos          varint
//! parent_count   varint
//!   hash         32 bytes
//!   creator      varint
//!   birth_round  varint
//! tx_count       varint
//!   len          varint
//!   bytes        len bytes
//! sig_len        varint
//! sig            sig_len bytes
//! ```

use chrono::DateTime;

use super::{EventCore, EventDescriptor, EventHash, GossipEvent, HASH_LEN, NodeId, Signature};
use crate::error::ErrorCode;

/// Errors produced while encoding or decoding an event payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("event payload truncated")]
    UnexpectedEof,

    #[error("varint overflow: more than 10 bytes")]
    VarintOverflow,

    #[error("declared length {declared} exceeds {remaining} remaining bytes")]
    LengthOverflow { declared: u64, remaining: usize },

    #[error("{0} trailing bytes after event payload")]
    TrailingBytes(usize),

    #[error("timestamp out of range: {secs}s {nanos}ns")]
    InvalidTimestamp { secs: i64, nanos: u64 },

    #[error("event of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

impl CodecError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TooLarge { .. } => ErrorCode::EventTooLarge,
            _ => ErrorCode::MalformedEvent,
        }
    }
}

// ---------------------------------------------------------------------------
// Varint helpers
// ---------------------------------------------------------------------------

/// Encode an unsigned 64-bit value as LEB128.
pub(crate) fn encode_varint(value: u64, buf: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a LEB128 varint, returning the value and bytes consumed.
pub(crate) fn decode_varint(data: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate() {
        let low = u64::from(byte & 0x7F);
        value |= low << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CodecError::VarintOverflow);
        }
    }
    Err(CodecError::UnexpectedEof)
}

#[inline]
pub(crate) const fn zigzag_encode(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)).cast_unsigned()
}

#[inline]
pub(crate) const fn zigzag_decode(n: u64) -> i64 {
    (n >> 1).cast_signed() ^ -((n & 1).cast_signed())
}

// ---------------------------------------------------------------------------
// EventCodec
// ---------------------------------------------------------------------------

/// Size-bounded encoder and decoder for log payloads.
#[derive(Debug, Clone, Copy)]
pub struct EventCodec {
    max_event_bytes: usize,
}

impl EventCodec {
    #[must_use]
    pub const fn new(max_event_bytes: usize) -> Self {
        Self { max_event_bytes }
    }

    #[must_use]
    pub const fn max_event_bytes(&self) -> usize {
        self.max_event_bytes
    }

    /// Encode `event`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooLarge`] if the payload exceeds the limit.
    pub fn encode(&self, event: &GossipEvent) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(64 + event.transaction_bytes());

        encode_varint(event.core.creator.0, &mut buf);
        encode_varint(event.core.birth_round, &mut buf);
        encode_varint(zigzag_encode(event.core.time_created.timestamp()), &mut buf);
        encode_varint(
            u64::from(event.core.time_created.timestamp_subsec_nanos()),
            &mut buf,
        );

        encode_varint(event.parents.len() as u64, &mut buf);
        for parent in &event.parents {
            buf.extend_from_slice(parent.hash.as_bytes());
            encode_varint(parent.creator.0, &mut buf);
            encode_varint(parent.birth_round, &mut buf);
        }

        encode_varint(event.transactions.len() as u64, &mut buf);
        for tx in &event.transactions {
            encode_varint(tx.len() as u64, &mut buf);
            buf.extend_from_slice(tx);
        }

        encode_varint(event.signature.0.len() as u64, &mut buf);
        buf.extend_from_slice(&event.signature.0);

        if buf.len() > self.max_event_bytes {
            return Err(CodecError::TooLarge {
                len: buf.len(),
                max: self.max_event_bytes,
            });
        }
        Ok(buf)
    }

    /// Decode exactly one event from `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] on truncation, trailing bytes, oversize input
    /// or out-of-range values.
    pub fn decode(&self, data: &[u8]) -> Result<GossipEvent, CodecError> {
        if data.len() > self.max_event_bytes {
            return Err(CodecError::TooLarge {
                len: data.len(),
                max: self.max_event_bytes,
            });
        }

        let mut cursor = Cursor { data, pos: 0 };

        let creator = NodeId(cursor.varint()?);
        let birth_round = cursor.varint()?;
        let secs = zigzag_decode(cursor.varint()?);
        let nanos = cursor.varint()?;
        let time_created = u32::try_from(nanos)
            .ok()
            .and_then(|n| DateTime::from_timestamp(secs, n))
            .ok_or(CodecError::InvalidTimestamp { secs, nanos })?;

        let parent_count = cursor.count(HASH_LEN + 2)?;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            let hash = cursor.hash()?;
            let creator = NodeId(cursor.varint()?);
            let birth_round = cursor.varint()?;
            parents.push(EventDescriptor {
                hash,
                creator,
                birth_round,
            });
        }

        let tx_count = cursor.count(1)?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            let len = cursor.count(1)?;
            transactions.push(cursor.take(len)?.to_vec());
        }

        let sig_len = cursor.count(1)?;
        let signature = Signature(cursor.take(sig_len)?.to_vec());

        let rest = data.len() - cursor.pos;
        if rest != 0 {
            return Err(CodecError::TrailingBytes(rest));
        }

        Ok(GossipEvent::new(
            EventCore {
                creator,
                birth_round,
                time_created,
            },
            parents,
            transactions,
            signature,
        ))
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn varint(&mut self) -> Result<u64, CodecError> {
        let (value, used) = decode_varint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    /// A count or length, rejected if `min_item_len` bytes per item could not
    /// possibly fit in what remains. Keeps a corrupt length from driving a
    /// huge allocation.
    fn count(&mut self, min_item_len: usize) -> Result<usize, CodecError> {
        let declared = self.varint()?;
        let remaining = self.data.len() - self.pos;
        let fits = usize::try_from(declared)
            .ok()
            .filter(|n| n.saturating_mul(min_item_len) <= remaining);
        fits.ok_or(CodecError::LengthOverflow {
            declared,
            remaining,
        })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn hash(&mut self) -> Result<EventHash, CodecError> {
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(self.take(HASH_LEN)?);
        Ok(EventHash::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(birth_round: u64) -> GossipEvent {
        GossipEvent::new(
            EventCore {
                creator: NodeId(300),
                birth_round,
                time_created: Utc.timestamp_opt(-5, 999_999_999).single().expect("ts"),
            },
            vec![EventDescriptor {
                hash: EventHash::from_bytes([0xAB; HASH_LEN]),
                creator: NodeId(2),
                birth_round: birth_round.saturating_sub(1),
            }],
            vec![vec![], vec![1, 2, 3]],
            Signature(vec![0x55; 64]),
        )
    }

    #[test]
    fn varint_boundaries() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            assert_eq!(decode_varint(&buf), Ok((value, buf.len())));
        }
        assert_eq!(decode_varint(&[0x80]), Err(CodecError::UnexpectedEof));
        assert_eq!(decode_varint(&[0xFF; 11]), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn zigzag_maps_small_magnitudes_to_small_codes() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
    }

    #[test]
    fn decode_restores_negative_timestamps_and_empty_payloads() {
        let codec = EventCodec::new(4096);
        let event = sample(12);
        let bytes = codec.encode(&event).expect("encode");
        assert_eq!(codec.decode(&bytes), Ok(event));
    }

    #[test]
    fn every_truncation_is_rejected() {
        let codec = EventCodec::new(4096);
        let bytes = codec.encode(&sample(3)).expect("encode");
        for cut in 0..bytes.len() {
            assert!(codec.decode(&bytes[..cut]).is_err(), "prefix {cut} decoded");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let codec = EventCodec::new(4096);
        let mut bytes = codec.encode(&sample(3)).expect("encode");
        bytes.push(0);
        assert_eq!(codec.decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn size_limit_applies_both_ways() {
        let codec = EventCodec::new(32);
        let err = codec.encode(&sample(3)).expect_err("too big");
        assert_eq!(err.code(), ErrorCode::EventTooLarge);
        assert!(matches!(
            codec.decode(&[0u8; 33]),
            Err(CodecError::TooLarge { len: 33, max: 32 })
        ));
    }

    #[test]
    fn absurd_counts_do_not_allocate() {
        let codec = EventCodec::new(4096);
        let mut bytes = Vec::new();
        for field in [1u64, 1, 0, 0] {
            encode_varint(field, &mut bytes);
        }
        encode_varint(u64::MAX, &mut bytes);
        assert!(matches!(
            codec.decode(&bytes),
            Err(CodecError::LengthOverflow { .. })
        ));
    }
}
