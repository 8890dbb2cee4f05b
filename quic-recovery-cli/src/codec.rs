//! ACK frame wire encoding (RFC 9000 §19.3)
//!
//! Frame layout, every field a variable-length integer:
//!
//! ```text
//! type (0x02 | 0x03 with ECN counts)
//! Largest Acknowledged
//! ACK Delay (microseconds >> ack_delay_exponent)
//! ACK Range Count
//! First ACK Range
//! (Gap, ACK Range Length) * ACK Range Count
//! [ECT0 Count, ECT1 Count, ECN-CE Count]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quic_recovery::ack::{AckFrame, EcnCounts, GapEncodedRanges};
use std::time::Duration;
use thiserror::Error;

/// ACK frame type
pub const ACK_FRAME_TYPE: u64 = 0x02;

/// ACK frame type carrying ECN counts
pub const ACK_ECN_FRAME_TYPE: u64 = 0x03;

/// Default ack_delay_exponent transport parameter
pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

/// Largest ack_delay_exponent a peer may announce
pub const MAX_ACK_DELAY_EXPONENT: u8 = 20;

/// Largest value a variable-length integer can hold
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Encoded size of a variable-length integer
pub fn varint_len(value: u64) -> usize {
    if value < 1 << 6 {
        1
    } else if value < 1 << 14 {
        2
    } else if value < 1 << 30 {
        4
    } else {
        8
    }
}

/// Append a variable-length integer (RFC 9000 §16)
pub fn put_varint(buf: &mut impl BufMut, value: u64) -> Result<(), CodecError> {
    match varint_len(value) {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ if value <= MAX_VARINT => buf.put_u64(0xc000_0000_0000_0000 | value),
        _ => return Err(CodecError::VarintOverflow(value)),
    }
    Ok(())
}

/// Read a variable-length integer
pub fn get_varint(buf: &mut impl Buf) -> Result<u64, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::UnexpectedEnd);
    }
    let first = buf.chunk()[0];
    let len = 1usize << (first >> 6);
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEnd);
    }
    let value = match len {
        1 => u64::from(buf.get_u8()),
        2 => u64::from(buf.get_u16() & 0x3fff),
        4 => u64::from(buf.get_u32() & 0x3fff_ffff),
        _ => buf.get_u64() & MAX_VARINT,
    };
    Ok(value)
}

/// Encoder and decoder of ACK frames for one ack_delay_exponent
#[derive(Debug, Clone, Copy)]
pub struct AckCodec {
    ack_delay_exponent: u8,
}

impl Default for AckCodec {
    fn default() -> Self {
        AckCodec {
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
        }
    }
}

impl AckCodec {
    pub fn new(ack_delay_exponent: u8) -> Result<Self, CodecError> {
        if ack_delay_exponent > MAX_ACK_DELAY_EXPONENT {
            return Err(CodecError::InvalidAckDelayExponent(ack_delay_exponent));
        }
        Ok(AckCodec { ack_delay_exponent })
    }

    pub fn ack_delay_exponent(&self) -> u8 {
        self.ack_delay_exponent
    }

    /// Encoded size of `ack`
    pub fn encoded_len(&self, ack: &AckFrame) -> Result<usize, CodecError> {
        let encoded = ack.to_gap_encoding().ok_or(CodecError::InvalidRanges)?;
        let frame_type = if ack.ecn.is_some() { ACK_ECN_FRAME_TYPE } else { ACK_FRAME_TYPE };
        let mut len = varint_len(frame_type)
            + varint_len(encoded.largest)
            + varint_len(self.encode_delay(ack.ack_delay))
            + varint_len(encoded.ranges.len() as u64)
            + varint_len(encoded.first_range);
        for &(gap, range) in &encoded.ranges {
            len += varint_len(gap) + varint_len(range);
        }
        if let Some(ecn) = ack.ecn {
            len += varint_len(ecn.ect0) + varint_len(ecn.ect1) + varint_len(ecn.ce);
        }
        Ok(len)
    }

    pub fn encode(&self, ack: &AckFrame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len(ack)?);
        self.encode_into(ack, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn encode_into(&self, ack: &AckFrame, buf: &mut impl BufMut) -> Result<(), CodecError> {
        let encoded = ack.to_gap_encoding().ok_or(CodecError::InvalidRanges)?;

        let frame_type = if ack.ecn.is_some() { ACK_ECN_FRAME_TYPE } else { ACK_FRAME_TYPE };
        put_varint(buf, frame_type)?;
        put_varint(buf, encoded.largest)?;
        put_varint(buf, self.encode_delay(ack.ack_delay))?;
        put_varint(buf, encoded.ranges.len() as u64)?;
        put_varint(buf, encoded.first_range)?;
        for &(gap, range) in &encoded.ranges {
            put_varint(buf, gap)?;
            put_varint(buf, range)?;
        }
        if let Some(ecn) = ack.ecn {
            put_varint(buf, ecn.ect0)?;
            put_varint(buf, ecn.ect1)?;
            put_varint(buf, ecn.ce)?;
        }
        Ok(())
    }

    /// Decode one ACK frame, type field included
    pub fn decode(&self, buf: &mut impl Buf) -> Result<AckFrame, CodecError> {
        let frame_type = get_varint(buf)?;
        let with_ecn = match frame_type {
            ACK_FRAME_TYPE => false,
            ACK_ECN_FRAME_TYPE => true,
            other => return Err(CodecError::UnknownFrameType(other)),
        };

        let largest = get_varint(buf)?;
        let ack_delay = self.decode_delay(get_varint(buf)?)?;
        let range_count = get_varint(buf)?;
        let first_range = get_varint(buf)?;

        // every range takes at least two bytes
        if range_count > (buf.remaining() / 2) as u64 {
            return Err(CodecError::UnexpectedEnd);
        }
        let mut ranges = Vec::with_capacity(range_count as usize);
        for _ in 0..range_count {
            let gap = get_varint(buf)?;
            let len = get_varint(buf)?;
            ranges.push((gap, len));
        }

        let encoded = GapEncodedRanges {
            largest,
            first_range,
            ranges,
        };
        let mut ack = AckFrame::from_gap_encoding(&encoded, ack_delay).ok_or(CodecError::InvalidRanges)?;

        if with_ecn {
            ack = ack.with_ecn(EcnCounts {
                ect0: get_varint(buf)?,
                ect1: get_varint(buf)?,
                ce: get_varint(buf)?,
            });
        }
        Ok(ack)
    }

    fn encode_delay(&self, delay: Duration) -> u64 {
        let micros = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        (micros >> self.ack_delay_exponent).min(MAX_VARINT)
    }

    fn decode_delay(&self, value: u64) -> Result<Duration, CodecError> {
        value
            .checked_mul(1 << self.ack_delay_exponent)
            .map(Duration::from_micros)
            .ok_or(CodecError::AckDelayOverflow(value))
    }
}

/// ACK frame encoding and decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of frame")]
    UnexpectedEnd,

    #[error("value {0} does not fit a variable-length integer")]
    VarintOverflow(u64),

    #[error("unknown frame type {0:#x}")]
    UnknownFrameType(u64),

    #[error("invalid ACK ranges")]
    InvalidRanges,

    #[error("ACK delay {0} overflows")]
    AckDelayOverflow(u64),

    #[error("invalid ack_delay_exponent {0}")]
    InvalidAckDelayExponent(u8),
}
