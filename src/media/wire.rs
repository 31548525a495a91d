use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed header carried by every data frame:
/// `u64 sequence | u64 sender_qpc | u64 sender_qpf | u32 flags`,
/// all little-endian.
pub const HEADER_LEN: usize = 28;

/// Control datagrams are header-sized but carry a sentinel sequence.
pub const CONTROL_LEN: usize = 24;

/// Sequence sentinel marking a resend request.
pub const RESEND_SENTINEL: u64 = u64::MAX;

/// Sequence sentinel marking the start-of-stream announcement.
pub const START_SENTINEL: u64 = u64::MAX - 1;

/// Largest sequence a data frame may carry.
pub const MAX_SEQUENCE: u64 = u64::MAX - 2;

/// Stream flags carried by data frames.
pub mod flags {
    /// This frame answers a resend request.
    pub const RESENT: u32 = 0b1;
}

/// Wire-level decode failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("sequence {0} collides with the sentinel space")]
    SequenceOutOfRange(u64),
}

/// Header of one media-stream data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub sender_qpc: u64,
    pub sender_qpf: u64,
    pub flags: u32,
}

/// A decoded media-stream datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// A data frame with its pattern payload
    Frame { header: FrameHeader, payload: Bytes },
    /// A client asking the server to resend `[low, high]` inclusive
    ResendRequest { low: u64, high: u64 },
    /// A client announcing itself to the server
    Start,
}

/// Encodes a data frame into one datagram.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Bytes, WireError> {
    if header.sequence > MAX_SEQUENCE {
        return Err(WireError::SequenceOutOfRange(header.sequence));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u64_le(header.sequence);
    buf.put_u64_le(header.sender_qpc);
    buf.put_u64_le(header.sender_qpf);
    buf.put_u32_le(header.flags);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encodes a resend request for the inclusive range `[low, high]`.
pub fn encode_resend_request(low: u64, high: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(CONTROL_LEN);
    buf.put_u64_le(RESEND_SENTINEL);
    buf.put_u64_le(low);
    buf.put_u64_le(high);
    buf.freeze()
}

/// Encodes the start-of-stream announcement.
pub fn encode_start() -> Bytes {
    let mut buf = BytesMut::with_capacity(CONTROL_LEN);
    buf.put_u64_le(START_SENTINEL);
    buf.put_u64_le(0);
    buf.put_u64_le(0);
    buf.freeze()
}

/// Classifies and decodes one received datagram.
pub fn decode(datagram: &[u8]) -> Result<Datagram, WireError> {
    if datagram.len() < 8 {
        return Err(WireError::Truncated {
            expected: 8,
            actual: datagram.len(),
        });
    }
    let mut buf = datagram;
    let sequence = buf.get_u64_le();
    match sequence {
        RESEND_SENTINEL => {
            if datagram.len() < CONTROL_LEN {
                return Err(WireError::Truncated {
                    expected: CONTROL_LEN,
                    actual: datagram.len(),
                });
            }
            let low = buf.get_u64_le();
            let high = buf.get_u64_le();
            Ok(Datagram::ResendRequest { low, high })
        }
        START_SENTINEL => Ok(Datagram::Start),
        sequence => {
            if datagram.len() < HEADER_LEN {
                return Err(WireError::Truncated {
                    expected: HEADER_LEN,
                    actual: datagram.len(),
                });
            }
            let header = FrameHeader {
                sequence,
                sender_qpc: buf.get_u64_le(),
                sender_qpf: buf.get_u64_le(),
                flags: buf.get_u32_le(),
            };
            Ok(Datagram::Frame {
                header,
                payload: Bytes::copy_from_slice(buf),
            })
        }
    }
}
