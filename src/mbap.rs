//! MBAP (Modbus Application Protocol) TCP framing: 7-byte header, a
//! length-prefixed PDU, and transaction-id tracking for the client side.

use crate::bytes::{read_u16_be, write_u16_be};
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 7;
pub const MAX_ADU_LEN: usize = 260;
const MAX_LENGTH_FIELD: u16 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let protocol_id = read_u16_be(bytes, 2);
        if protocol_id != 0 {
            return Err(Error::Framing {
                reason: "MBAP protocol id must be zero",
            });
        }
        let length = read_u16_be(bytes, 4);
        if length < 2 || length > MAX_LENGTH_FIELD {
            return Err(Error::Framing {
                reason: "MBAP length field out of range",
            });
        }
        Ok(Self {
            transaction_id: read_u16_be(bytes, 0),
            protocol_id,
            length,
            unit_id: bytes[6],
        })
    }

    pub fn write(&self, out: &mut [u8; HEADER_LEN]) {
        write_u16_be(out, 0, self.transaction_id);
        write_u16_be(out, 2, self.protocol_id);
        write_u16_be(out, 4, self.length);
        out[6] = self.unit_id;
    }
}

/// Encodes a full MBAP ADU (header + PDU) into `out`, returning total
/// length. `pdu_frame` is the function code byte followed by its payload.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu_frame: &[u8], out: &mut [u8]) -> Result<usize> {
    let total = HEADER_LEN + pdu_frame.len();
    if total > out.len() || total > MAX_ADU_LEN {
        return Err(Error::InvalidArgument {
            reason: "destination buffer too small for MBAP frame",
        });
    }
    let header = MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: (1 + pdu_frame.len()) as u16,
        unit_id,
    };
    let mut header_bytes = [0u8; HEADER_LEN];
    header.write(&mut header_bytes);
    out[..HEADER_LEN].copy_from_slice(&header_bytes);
    out[HEADER_LEN..total].copy_from_slice(pdu_frame);
    Ok(total)
}

pub struct DecodedAdu<'a> {
    pub header: MbapHeader,
    pub pdu: &'a [u8],
}

/// Decodes a complete MBAP ADU (caller has already ensured
/// `bytes.len() == HEADER_LEN + header.length - 1`).
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedAdu<'_>> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Framing {
            reason: "MBAP frame shorter than header",
        });
    }
    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&bytes[..HEADER_LEN]);
    let header = MbapHeader::parse(&header_bytes)?;
    let expected_total = HEADER_LEN + header.length as usize - 1;
    if bytes.len() != expected_total {
        return Err(Error::Framing {
            reason: "MBAP frame length does not match header",
        });
    }
    Ok(DecodedAdu {
        header,
        pdu: &bytes[HEADER_LEN..],
    })
}

/// Buffers an incoming TCP byte stream and reports once a complete ADU is
/// available: first the 6 length-bearing header bytes, then
/// `header.length - 1 + 1` (unit_id + PDU) more bytes.
pub struct MbapReceiver {
    buf: [u8; MAX_ADU_LEN],
    len: usize,
}

pub enum MbapPoll {
    NeedMore,
    FrameReady(usize),
    FramingError,
}

impl MbapReceiver {
    pub fn new() -> Self {
        Self {
            buf: [0u8; MAX_ADU_LEN],
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    pub fn frame(&self, total_len: usize) -> &[u8] {
        &self.buf[..total_len]
    }

    /// Appends `bytes`, returning the framing decision.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> MbapPoll {
        let n = bytes.len().min(MAX_ADU_LEN - self.len);
        if n < bytes.len() {
            self.reset();
            return MbapPoll::FramingError;
        }
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;

        if self.len < HEADER_LEN {
            return MbapPoll::NeedMore;
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&self.buf[..HEADER_LEN]);
        let header = match MbapHeader::parse(&header_bytes) {
            Ok(h) => h,
            Err(_) => {
                self.reset();
                return MbapPoll::FramingError;
            }
        };
        let total = HEADER_LEN + header.length as usize - 1;
        if total > MAX_ADU_LEN {
            self.reset();
            return MbapPoll::FramingError;
        }
        if self.len < total {
            return MbapPoll::NeedMore;
        }
        MbapPoll::FrameReady(total)
    }
}

impl Default for MbapReceiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the transaction id the client expects a response for, and rejects
/// frames whose TID doesn't match (counted by the caller as
/// `tcp_tid_mismatch`).
#[derive(Debug, Clone, Copy)]
pub struct TidTracker {
    next: u16,
    expected: Option<u16>,
}

impl TidTracker {
    pub fn new() -> Self {
        Self {
            next: 1,
            expected: None,
        }
    }

    /// Allocates the next transaction id and records it as the one we're
    /// waiting on.
    pub fn begin(&mut self) -> u16 {
        let tid = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            self.next = 1;
        }
        self.expected = Some(tid);
        tid
    }

    pub fn matches(&self, tid: u16) -> bool {
        self.expected == Some(tid)
    }

    pub fn clear(&mut self) {
        self.expected = None;
    }
}

impl Default for TidTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_fc03_request_bytes() {
        // TID=1, unit=0x11 (TID tracked against the in-flight request)
        let pdu = [0x03, 0x00, 0x00, 0x00, 0x01];
        let mut out = [0u8; 16];
        let n = encode_frame(1, 0x11, &pdu, &mut out).unwrap();
        assert_eq!(
            &out[..n],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn tcp_fc03_response_decodes() {
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x11, 0x03, 0x02, 0x00, 0x2A];
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.header.transaction_id, 1);
        assert_eq!(decoded.header.unit_id, 0x11);
        assert_eq!(decoded.pdu, &[0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn rejects_nonzero_protocol_id() {
        let frame = [0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x11, 0x03];
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn receiver_needs_full_frame() {
        let mut rx = MbapReceiver::new();
        assert!(matches!(rx.push_bytes(&[0x00, 0x01, 0x00]), MbapPoll::NeedMore));
        match rx.push_bytes(&[0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x00, 0x00, 0x01]) {
            MbapPoll::FrameReady(total) => assert_eq!(total, 12),
            _ => panic!("expected FrameReady"),
        }
    }

    #[test]
    fn tid_tracker_detects_mismatch() {
        let mut tracker = TidTracker::new();
        let tid = tracker.begin();
        assert!(tracker.matches(tid));
        assert!(!tracker.matches(tid.wrapping_add(1)));
    }
}
