//! Error taxonomy shared by every layer of the core: framing, PDU codec,
//! client FSM, and server FSM all report through this single enum.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Modbus exception codes as defined by the protocol (returned in the single
/// payload byte of an exception reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerFailure,
    Acknowledge,
    ServerBusy,
    MemoryParity,
    GatewayPathUnavailable,
    GatewayTargetNoResponse,
    /// Any code the protocol defines that this enum does not name explicitly.
    Other(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => Self::IllegalFunction,
            2 => Self::IllegalDataAddress,
            3 => Self::IllegalDataValue,
            4 => Self::ServerFailure,
            5 => Self::Acknowledge,
            6 => Self::ServerBusy,
            8 => Self::MemoryParity,
            10 => Self::GatewayPathUnavailable,
            11 => Self::GatewayTargetNoResponse,
            other => Self::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::IllegalFunction => 1,
            Self::IllegalDataAddress => 2,
            Self::IllegalDataValue => 3,
            Self::ServerFailure => 4,
            Self::Acknowledge => 5,
            Self::ServerBusy => 6,
            Self::MemoryParity => 8,
            Self::GatewayPathUnavailable => 10,
            Self::GatewayTargetNoResponse => 11,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerBusy => "server device busy",
            Self::MemoryParity => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetNoResponse => "gateway target device failed to respond",
            Self::Other(_) => "unrecognized exception code",
        };
        write!(f, "{} (0x{:02x})", name, self.to_u8())
    }
}

/// The full error taxonomy. `Ok` covers the `OK` status from the protocol
/// design; every other status maps to a variant here.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No response/progress within the configured deadline. Transient;
    /// the client FSM retries automatically up to `max_retries`.
    #[error("operation timed out")]
    Timeout,

    /// The transport reported a hard failure; the connection is likely
    /// unusable until the caller reconnects it.
    #[error("transport error")]
    Transport,

    /// Caller supplied a value outside the limits the protocol allows
    /// (e.g. quantity out of range, illegal coil value).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: &'static str },

    /// API misuse: a null/empty buffer, zero capacity, etc.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// A pool or queue is full.
    #[error("no resources available")]
    NoResources,

    /// RTU CRC-16 mismatch.
    #[error("CRC mismatch: expected 0x{expected:04x}, got 0x{actual:04x}")]
    Crc { expected: u16, actual: u16 },

    /// The byte stream violates framing rules (bad silence timing, bad
    /// MBAP length field, truncated frame).
    #[error("framing error: {reason}")]
    Framing { reason: &'static str },

    /// The peer replied with a Modbus exception.
    #[error("exception reply: {0}")]
    Exception(ExceptionCode),

    /// The operation was cancelled locally.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Transport
    }
}
