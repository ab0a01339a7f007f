//! Portable Modbus client/server core.
//!
//! # Architecture
//!
//! Three codecs (`pdu`, `rtu`, `mbap`) sit underneath two cooperative,
//! poll-driven state machines (`client`, `server`). Both FSMs are built
//! against the `Transport` trait in `transport`, so the same core runs over
//! a serial port, a TCP socket, or an in-memory loopback without change.
//! Nothing in the core blocks or allocates on the heap: transaction pools,
//! storage regions, and frame buffers are all fixed-size.
//!
//! # Features
//!
//! - RTU framing with silence-timer based frame boundaries and CRC-16.
//! - MBAP/TCP framing with transaction-id tracking.
//! - A client FSM: transaction queue, timeout/retry/backoff, watchdog.
//! - A server FSM: storage regions, custom handlers, broadcast and
//!   listen-only support.
//! - A windowed duplicate-frame filter and a small diagnostics/event sink.
//! - A façade (`gate`) for running several TCP connections behind one
//!   caller-visible surface.

pub mod bytes;
pub mod client;
pub mod config;
pub mod crc;
pub mod dedup;
pub mod diagnostics;
pub mod error;
pub mod gate;
pub mod mbap;
pub mod pdu;
pub mod ring;
pub mod rtu;
pub mod server;
pub mod transport;

pub use client::{ClientFsm, Priority, Request as ClientRequest, TxHandle};
pub use config::{ClientConfig, DedupConfig, DiagConfig, RtuConfig, ServerConfig, TcpConfig, WireParity};
pub use error::{Error, ExceptionCode, Result};
pub use pdu::Pdu;
pub use server::{Backing, RegionKind, ServerFsm};
pub use transport::{IoResult, Transport, TransportStatus};

/// Crate version, re-exported for hosts that want to report it alongside
/// their own build info.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
