//! RTU framing: silence-based frame boundaries, CRC-16 trailer, and the
//! t1.5/t3.5 guard timing the protocol derives from baud rate and parity.

use crate::crc::{append_crc, crc16_validate};
use crate::error::{Error, Result};

/// Maximum RTU frame size: 1 (unit) + 253 (PDU) + 2 (CRC).
pub const MAX_RTU_FRAME: usize = 256;
const MIN_RTU_FRAME: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Derives t1.5/t3.5 guard times (in microseconds) from line parameters.
#[derive(Debug, Clone, Copy)]
pub struct RtuTiming {
    pub t15_us: u64,
    pub t35_us: u64,
}

impl RtuTiming {
    /// Computes guard times per the protocol's standard formula. Baud rates
    /// at or above 19200 use the fixed 750us/1750us floor the protocol
    /// specifies instead of scaling further with character time.
    pub fn from_line(baud: u32, parity: Parity, stop_bits: u8) -> Self {
        if baud >= 19200 {
            return Self {
                t15_us: 750,
                t35_us: 1750,
            };
        }
        let data_bits = 8u64;
        let parity_bits = if parity == Parity::None { 0 } else { 1 };
        let stop = stop_bits as u64;
        let bits_per_char = 1 + data_bits + parity_bits + stop; // start + data + parity + stop
        let char_time_us = (bits_per_char * 1_000_000).div_ceil(baud as u64);
        Self {
            t15_us: (char_time_us * 3).div_ceil(2),
            t35_us: (char_time_us * 7).div_ceil(2),
        }
    }

    /// Explicit override, bypassing the formula.
    pub fn custom(t15_us: u64, t35_us: u64) -> Self {
        Self { t15_us, t35_us }
    }

    pub fn t35_ms(&self) -> u64 {
        self.t35_us.div_ceil(1000).max(1)
    }

    pub fn t15_ms(&self) -> u64 {
        self.t15_us.div_ceil(1000).max(1)
    }
}

/// Encodes `unit_id` + `pdu_frame` (function code + payload, already
/// serialized) into `out`, appending the little-endian CRC-16 trailer.
/// Returns the total frame length.
pub fn encode_frame(unit_id: u8, pdu_frame: &[u8], out: &mut [u8]) -> Result<usize> {
    let body_len = 1 + pdu_frame.len();
    if body_len + 2 > out.len() {
        return Err(Error::InvalidArgument {
            reason: "destination buffer too small for RTU frame",
        });
    }
    out[0] = unit_id;
    out[1..1 + pdu_frame.len()].copy_from_slice(pdu_frame);
    let mut crc_buf = [0u8; 2];
    append_crc(&out[..body_len], &mut crc_buf);
    out[body_len..body_len + 2].copy_from_slice(&crc_buf);
    Ok(body_len + 2)
}

/// A decoded RTU frame view: unit id plus the PDU bytes (function code +
/// payload), CRC already verified and stripped.
pub struct DecodedFrame<'a> {
    pub unit_id: u8,
    pub pdu: &'a [u8],
}

/// Validates and strips the CRC trailer from a raw RTU frame.
pub fn decode_frame(frame: &[u8]) -> Result<DecodedFrame<'_>> {
    if frame.len() < MIN_RTU_FRAME || frame.len() > MAX_RTU_FRAME {
        return Err(Error::Framing {
            reason: "RTU frame length out of range",
        });
    }
    if let Err((expected, actual)) = crc16_validate(frame) {
        return Err(Error::Crc { expected, actual });
    }
    Ok(DecodedFrame {
        unit_id: frame[0],
        pdu: &frame[1..frame.len() - 2],
    })
}

/// Accumulates bytes from the transport and declares a frame complete once
/// t3.5 of silence has elapsed since the last byte arrived. Owns a fixed
/// buffer; this is the only state a caller needs per RTU line.
pub struct RtuReceiver {
    buf: [u8; MAX_RTU_FRAME],
    len: usize,
    last_byte_ms: Option<u64>,
    timing: RtuTiming,
}

pub enum RtuPoll {
    /// No complete frame yet; keep reading.
    Pending,
    /// A frame's silence window has elapsed. Caller should validate with
    /// `decode_frame` and then call `reset`.
    FrameReady,
    /// Byte received mid-frame later than t1.5 (but before t3.5) after the
    /// previous one, or the buffer overflowed: a framing violation. Caller
    /// should count it and `reset` (this implementation already has).
    FramingError,
}

impl RtuReceiver {
    pub fn new(timing: RtuTiming) -> Self {
        Self {
            buf: [0u8; MAX_RTU_FRAME],
            len: 0,
            last_byte_ms: None,
            timing,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.last_byte_ms = None;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Feeds newly received bytes at timestamp `now_ms`. Returns
    /// `FramingError` immediately on overflow, or if the gap since the
    /// previous byte exceeds t1.5 without yet reaching t3.5 (a broken
    /// character run); otherwise the caller should follow up with
    /// `poll_silence`. A gap at or beyond t3.5 means the previous partial
    /// frame already went silent, so it is dropped without counting an
    /// error and these bytes start a fresh frame.
    pub fn push_bytes(&mut self, bytes: &[u8], now_ms: u64) -> RtuPoll {
        if self.len > 0 {
            if let Some(last) = self.last_byte_ms {
                let gap = now_ms.saturating_sub(last);
                if gap >= self.timing.t35_ms() {
                    self.reset();
                } else if gap > self.timing.t15_ms() {
                    self.reset();
                    return RtuPoll::FramingError;
                }
            }
        }
        if self.len + bytes.len() > MAX_RTU_FRAME {
            self.reset();
            return RtuPoll::FramingError;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self.last_byte_ms = Some(now_ms);
        RtuPoll::Pending
    }

    /// Call once per poll iteration with the current time to check whether
    /// the silence window has elapsed.
    pub fn poll_silence(&self, now_ms: u64) -> RtuPoll {
        match self.last_byte_ms {
            Some(last) if self.len > 0 && now_ms.saturating_sub(last) >= self.timing.t35_ms() => {
                RtuPoll::FrameReady
            }
            _ => RtuPoll::Pending,
        }
    }
}
