//! Plain configuration records for the client and server FSMs. Loading
//! these from a file, environment, or CLI is left to the embedding
//! application; the crate only defines the shape and its defaults, with
//! `Serialize`/`Deserialize` available behind the `serde` feature (mirrors
//! a conventional plain-data config struct style).

use crate::dedup::{DEFAULT_WINDOW_MS, DEFAULT_WINDOW_SIZE};
use crate::rtu::{Parity, RtuTiming};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DedupConfig {
    pub window_size: usize,
    pub window_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagConfig {
    pub enable_trace_hex: bool,
    pub idle_threshold_ms: u64,
}

impl Default for DiagConfig {
    fn default() -> Self {
        Self {
            enable_trace_hex: false,
            idle_threshold_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WireParity {
    None,
    Even,
    Odd,
}

impl From<WireParity> for Parity {
    fn from(p: WireParity) -> Self {
        match p {
            WireParity::None => Parity::None,
            WireParity::Even => Parity::Even,
            WireParity::Odd => Parity::Odd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RtuConfig {
    pub baud: u32,
    pub parity: WireParity,
    pub stop_bits: u8,
    /// Overrides the derived t1.5 guard time in microseconds; `None` uses
    /// the formula in `rtu::RtuTiming::from_line`.
    pub t15_us: Option<u64>,
    pub t35_us: Option<u64>,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            baud: 19200,
            parity: WireParity::None,
            stop_bits: 1,
            t15_us: None,
            t35_us: None,
        }
    }
}

impl RtuConfig {
    /// Derives the guard timing this line configuration implies, honoring
    /// an explicit `t15_us`/`t35_us` override over the baud/parity formula.
    pub fn timing(&self) -> RtuTiming {
        let derived = RtuTiming::from_line(self.baud, self.parity.into(), self.stop_bits);
        RtuTiming {
            t15_us: self.t15_us.unwrap_or(derived.t15_us),
            t35_us: self.t35_us.unwrap_or(derived.t35_us),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TcpConfig {
    pub connect_timeout_ms: u64,
    pub recv_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            recv_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub max_retries: u8,
    /// Zero is resolved to `timeout_ms / 2` at the point of use
    /// (`client::Transaction::effective_backoff`), not here.
    pub backoff_ms: u64,
    pub watchdog_ms: u64,
    pub queue_capacity: usize,
    pub rtu: RtuConfig,
    pub tcp: TcpConfig,
    pub diag: DiagConfig,
    pub dup_filter: DedupConfig,
    /// Off by default: duplicate suppression is normally the server's job
    /// (it sees retransmissions from a misbehaving master). Enable if this
    /// client also wants to ignore duplicate replies from a flaky link.
    pub dedup_responses: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            timeout_ms: 1_000,
            max_retries: 1,
            backoff_ms: 0,
            watchdog_ms: 2_000,
            queue_capacity: 0,
            rtu: RtuConfig::default(),
            tcp: TcpConfig::default(),
            diag: DiagConfig::default(),
            dup_filter: DedupConfig::default(),
            dedup_responses: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    pub unit_id: u8,
    pub watchdog_ms: u64,
    pub rtu: RtuConfig,
    pub tcp: TcpConfig,
    pub diag: DiagConfig,
    pub dup_filter: DedupConfig,
    /// When true, the server accepts frames for any unit id and never
    /// transmits a reply (passive sniffing mode).
    pub listen_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            unit_id: 1,
            watchdog_ms: 2_000,
            rtu: RtuConfig::default(),
            tcp: TcpConfig::default(),
            diag: DiagConfig::default(),
            dup_filter: DedupConfig::default(),
            listen_only: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults_match_spec() {
        let c = ClientConfig::default();
        assert_eq!(c.timeout_ms, 1_000);
        assert_eq!(c.max_retries, 1);
        assert_eq!(c.watchdog_ms, 2_000);
        assert_eq!(c.backoff_ms, 0);
    }

    #[test]
    fn server_defaults_are_not_listen_only() {
        let s = ServerConfig::default();
        assert!(!s.listen_only);
    }

    #[test]
    fn rtu_timing_override_wins_over_derived_formula() {
        let mut rtu = RtuConfig::default();
        rtu.t15_us = Some(1234);
        let timing = rtu.timing();
        assert_eq!(timing.t15_us, 1234);
        assert_eq!(timing.t35_us, 1750, "t35 keeps the derived value when not overridden");
    }
}
