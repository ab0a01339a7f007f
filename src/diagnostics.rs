//! Counters, a small trace ring, and a structured event callback shared by
//! the client and server FSMs. `tracing` covers the ambient log stream;
//! this module adds the counters/trace/callback surface hosts poll directly.

use crate::error::ExceptionCode;
use tracing::{debug, trace, warn};

const TRACE_CAPACITY: usize = 64;

/// Saturating counters for protocol-level events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub rx_frames: u16,
    pub tx_frames: u16,
    pub crc_errors: u16,
    pub framing_errors: u16,
    pub timeouts: u16,
    pub retries: u16,
    pub exceptions_sent: u16,
    pub exceptions_received: u16,
    pub broadcasts: u16,
    pub duplicates_suppressed: u16,
    pub tid_mismatches: u16,
}

macro_rules! bump {
    ($field:expr) => {
        $field = $field.saturating_add(1);
    };
}

impl Counters {
    pub fn bump_rx_frame(&mut self) {
        bump!(self.rx_frames);
    }
    pub fn bump_tx_frame(&mut self) {
        bump!(self.tx_frames);
    }
    pub fn bump_crc_error(&mut self) {
        bump!(self.crc_errors);
    }
    pub fn bump_framing_error(&mut self) {
        bump!(self.framing_errors);
    }
    pub fn bump_timeout(&mut self) {
        bump!(self.timeouts);
    }
    pub fn bump_retry(&mut self) {
        bump!(self.retries);
    }
    pub fn bump_exception_sent(&mut self) {
        bump!(self.exceptions_sent);
    }
    pub fn bump_exception_received(&mut self) {
        bump!(self.exceptions_received);
    }
    pub fn bump_broadcast(&mut self) {
        bump!(self.broadcasts);
    }
    pub fn bump_duplicate_suppressed(&mut self) {
        bump!(self.duplicates_suppressed);
    }
    pub fn bump_tid_mismatch(&mut self) {
        bump!(self.tid_mismatches);
    }
}

/// A single traced event, kept in a small fixed-size ring for post-mortem
/// inspection.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub function_code: u8,
    pub status: EventStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ClientStateEnter,
    ClientStateExit,
    ClientTxSubmit,
    ClientTxComplete,
    ServerStateEnter,
    ServerStateExit,
    ServerRequestAccept,
    ServerRequestComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ok,
    Timeout,
    Transport,
    Exception(ExceptionCode),
    Cancelled,
}

/// Callback invoked for every traced event, in addition to it being
/// recorded in the ring. Most hosts use this to forward events to their own
/// telemetry; `tracing` output happens independent of whether one is set.
pub type EventCallback = fn(&TraceEvent);

/// Idle hook: `(pending, jitter_max_ms, jitter_avg_ms)`, invoked once the
/// transaction/request queue has been empty for `idle_threshold_ms`.
pub type IdleCallback = fn(usize, u64, u64);

pub struct Diagnostics {
    pub counters: Counters,
    trace: [Option<TraceEvent>; TRACE_CAPACITY],
    trace_next: usize,
    callback: Option<EventCallback>,
    idle_callback: Option<IdleCallback>,
    trace_hex: bool,
    idle_threshold_ms: u64,
    idle_since_ms: Option<u64>,
    idle_fired: bool,
    last_poll_ms: Option<u64>,
    jitter_max_ms: u64,
    jitter_sum_ms: u64,
    jitter_samples: u64,
}

impl Diagnostics {
    pub fn new(idle_threshold_ms: u64) -> Self {
        Self {
            counters: Counters::default(),
            trace: [None; TRACE_CAPACITY],
            trace_next: 0,
            callback: None,
            idle_callback: None,
            trace_hex: false,
            idle_threshold_ms,
            idle_since_ms: None,
            idle_fired: false,
            last_poll_ms: None,
            jitter_max_ms: 0,
            jitter_sum_ms: 0,
            jitter_samples: 0,
        }
    }

    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    pub fn set_idle_callback(&mut self, callback: IdleCallback) {
        self.idle_callback = Some(callback);
    }

    pub fn set_trace_hex(&mut self, enabled: bool) {
        self.trace_hex = enabled;
    }

    pub fn record(&mut self, now_ms: u64, kind: EventKind, function_code: u8, status: EventStatus) {
        let event = TraceEvent {
            timestamp_ms: now_ms,
            kind,
            function_code,
            status,
        };
        self.trace[self.trace_next] = Some(event);
        self.trace_next = (self.trace_next + 1) % TRACE_CAPACITY;
        if let Some(cb) = self.callback {
            cb(&event);
        }
        trace!(?kind, function_code, ?status, "modbus event");
    }

    pub fn trace_hex_frame(&self, direction: &str, frame: &[u8]) {
        if self.trace_hex {
            debug!(direction, frame = %hex_dump(frame), "modbus frame");
        }
    }

    pub fn note_crc_error(&mut self, expected: u16, actual: u16) {
        self.counters.bump_crc_error();
        warn!(expected, actual, "RTU CRC mismatch");
    }

    pub fn note_framing_error(&mut self, reason: &str) {
        self.counters.bump_framing_error();
        warn!(reason, "framing error");
    }

    /// Called once per `poll`/`poll_with_budget` entry. Tracks jitter
    /// between successive polls and fires the idle hook (once per idle
    /// episode) when the queue has been empty for `idle_threshold_ms`.
    pub fn on_poll_tick(&mut self, now_ms: u64, pending: usize) {
        if let Some(last) = self.last_poll_ms {
            let delta = now_ms.saturating_sub(last);
            self.jitter_sum_ms += delta;
            self.jitter_samples += 1;
            self.jitter_max_ms = self.jitter_max_ms.max(delta);
        }
        self.last_poll_ms = Some(now_ms);

        if pending == 0 {
            let since = *self.idle_since_ms.get_or_insert(now_ms);
            if !self.idle_fired && now_ms.saturating_sub(since) >= self.idle_threshold_ms {
                self.idle_fired = true;
                if let Some(cb) = self.idle_callback {
                    let avg = if self.jitter_samples > 0 {
                        self.jitter_sum_ms / self.jitter_samples
                    } else {
                        0
                    };
                    cb(pending, self.jitter_max_ms, avg);
                }
            }
        } else {
            self.idle_since_ms = None;
            self.idle_fired = false;
        }
    }
}

fn hex_dump(frame: &[u8]) -> String {
    frame.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}
