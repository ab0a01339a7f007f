//! Server (slave) FSM: fixed storage regions, an optional custom handler
//! table, and broadcast/listen-only aware dispatch. Grounded in the
//! per-function-code handler naming of `server.rs`'s
//! `handle_read_holding_registers`/`handle_write_single_coil`/etc., rewritten
//! from async/Redis-backed storage to synchronous fixed-array regions.

use crate::bytes::{read_u16_be, unpack_bits};
use crate::dedup::{frame_hash, DuplicateFilter};
use crate::diagnostics::{Diagnostics, EventKind, EventStatus};
use crate::error::{Error, ExceptionCode, Result};
use crate::mbap::{self, MbapPoll, MbapReceiver};
use crate::pdu::{self, Pdu};
use crate::rtu::{self, RtuPoll, RtuReceiver, RtuTiming};
use crate::transport::Transport;

const MAX_FRAME: usize = 260;
const MAX_REGIONS: usize = 8;
const MAX_HANDLERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

/// A contiguous address range bound to a backing array. Registers live in
/// `u16` slots; coils/discretes live one bit per `bool` slot for simplicity
/// (still no heap — a fixed-size `[bool; N]` backing, not a `Vec<bool>`).
pub enum Backing<'a> {
    Registers(&'a mut [u16]),
    Bits(&'a mut [bool]),
}

struct Region<'a> {
    start: u16,
    count: u16,
    kind: RegionKind,
    read_only: bool,
    backing: Backing<'a>,
}

impl<'a> Region<'a> {
    fn covers(&self, kind: RegionKind, start: u16, count: u16) -> bool {
        if self.kind != kind {
            return false;
        }
        let end = start as u32 + count as u32;
        let region_end = self.start as u32 + self.count as u32;
        start as u32 >= self.start as u32 && end <= region_end
    }

    fn offset(&self, address: u16) -> usize {
        (address - self.start) as usize
    }
}

/// Custom per-function-code handler, taking precedence over storage
/// lookup. Returning `Err` maps to `SERVER_FAILURE` unless the error is
/// already `Exception(_)`, in which case that code is used directly.
pub type Handler = fn(unit_id: u8, payload: &[u8]) -> Result<Pdu>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Idle,
    Rx,
    Dispatch,
    BuildReply,
    Tx,
}

enum Mode {
    Rtu(RtuReceiver),
    Tcp(MbapReceiver),
}

pub struct ServerFsm<'a> {
    unit_id: u8,
    listen_only: bool,
    regions: [Option<Region<'a>>; MAX_REGIONS],
    handlers: [Option<(u8, Handler)>; MAX_HANDLERS],
    mode: Mode,
    state: FsmState,
    tx_buf: [u8; MAX_FRAME],
    tx_len: usize,
    tx_sent: usize,
    pending_unit: u8,
    pending_tid: u16,
    pending_pdu: Option<Pdu>,
    pending_broadcast: bool,
    dedup: Option<DuplicateFilter<8>>,
    pub diag: Diagnostics,
}

impl<'a> ServerFsm<'a> {
    pub fn new_rtu(unit_id: u8, listen_only: bool, timing: RtuTiming, idle_threshold_ms: u64) -> Self {
        Self::new(unit_id, listen_only, Mode::Rtu(RtuReceiver::new(timing)), idle_threshold_ms)
    }

    pub fn new_tcp(unit_id: u8, listen_only: bool, idle_threshold_ms: u64) -> Self {
        Self::new(unit_id, listen_only, Mode::Tcp(MbapReceiver::new()), idle_threshold_ms)
    }

    /// Builds an RTU server from a configuration record. The duplicate
    /// filter is enabled by default for servers (unlike the client, where
    /// it's opt-in via `ClientConfig::dedup_responses`).
    pub fn new_rtu_from_config(config: &crate::config::ServerConfig, timing: RtuTiming) -> Self {
        let mut server = Self::new_rtu(config.unit_id, config.listen_only, timing, config.diag.idle_threshold_ms);
        server.apply_config(config);
        server
    }

    /// Builds a TCP server from a configuration record.
    pub fn new_tcp_from_config(config: &crate::config::ServerConfig) -> Self {
        let mut server = Self::new_tcp(config.unit_id, config.listen_only, config.diag.idle_threshold_ms);
        server.apply_config(config);
        server
    }

    fn apply_config(&mut self, config: &crate::config::ServerConfig) {
        self.set_trace_hex(config.diag.enable_trace_hex);
        self.enable_dedup(config.dup_filter.window_ms);
    }

    fn new(unit_id: u8, listen_only: bool, mode: Mode, idle_threshold_ms: u64) -> Self {
        Self {
            unit_id,
            listen_only,
            regions: std::array::from_fn(|_| None),
            handlers: [None; MAX_HANDLERS],
            mode,
            state: FsmState::Idle,
            tx_buf: [0u8; MAX_FRAME],
            tx_len: 0,
            tx_sent: 0,
            pending_unit: 0,
            pending_tid: 0,
            pending_pdu: None,
            pending_broadcast: false,
            dedup: None,
            diag: Diagnostics::new(idle_threshold_ms),
        }
    }

    pub fn enable_dedup(&mut self, window_ms: u64) {
        self.dedup = Some(DuplicateFilter::new(window_ms));
    }

    pub fn set_event_callback(&mut self, callback: crate::diagnostics::EventCallback) {
        self.diag.set_event_callback(callback);
    }

    /// Installs the idle hook: fired once per idle episode, after the
    /// server has had no pending request for the diagnostics' configured
    /// `idle_threshold_ms`.
    pub fn set_idle_callback(&mut self, callback: crate::diagnostics::IdleCallback) {
        self.diag.set_idle_callback(callback);
    }

    pub fn set_trace_hex(&mut self, enabled: bool) {
        self.diag.set_trace_hex(enabled);
    }

    /// Registers a storage region. Rejects overlaps with an
    /// already-registered region of the same kind.
    pub fn add_storage(
        &mut self,
        start: u16,
        count: u16,
        kind: RegionKind,
        read_only: bool,
        backing: Backing<'a>,
    ) -> Result<()> {
        let new_end = start as u32 + count as u32;
        for r in self.regions.iter().flatten() {
            if r.kind == kind {
                let existing_end = r.start as u32 + r.count as u32;
                let overlap = (start as u32) < existing_end && new_end > r.start as u32;
                if overlap {
                    return Err(Error::InvalidArgument {
                        reason: "storage region overlaps an existing region of the same kind",
                    });
                }
            }
        }
        let slot = self
            .regions
            .iter()
            .position(|r| r.is_none())
            .ok_or(Error::NoResources)?;
        self.regions[slot] = Some(Region {
            start,
            count,
            kind,
            read_only,
            backing,
        });
        Ok(())
    }

    pub fn set_handler(&mut self, function_code: u8, handler: Handler) -> Result<()> {
        if let Some(slot) = self.handlers.iter_mut().find(|h| h.is_none()) {
            *slot = Some((function_code, handler));
            Ok(())
        } else {
            Err(Error::NoResources)
        }
    }

    fn find_handler(&self, function_code: u8) -> Option<Handler> {
        self.handlers
            .iter()
            .flatten()
            .find(|(fc, _)| *fc == function_code)
            .map(|(_, h)| *h)
    }

    fn find_region(&mut self, kind: RegionKind, start: u16, count: u16) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.as_ref().is_some_and(|r| r.covers(kind, start, count)))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, FsmState::Idle) && self.pending_pdu.is_none()
    }

    /// Number of requests currently in flight (0 or 1: the server handles
    /// one request at a time).
    pub fn pending(&self) -> usize {
        usize::from(!self.is_idle())
    }

    pub fn poll(&mut self, transport: &mut dyn Transport) -> Result<()> {
        self.poll_with_budget(transport, usize::MAX)
    }

    pub fn poll_with_budget(&mut self, transport: &mut dyn Transport, steps: usize) -> Result<()> {
        let now = transport.now();
        self.diag.on_poll_tick(now, if self.is_idle() { 0 } else { 1 });
        for _ in 0..steps {
            if !self.step(transport)? {
                break;
            }
        }
        Ok(())
    }

    fn step(&mut self, transport: &mut dyn Transport) -> Result<bool> {
        let now = transport.now();
        match self.state {
            FsmState::Idle => {
                let mut buf = [0u8; 64];
                let result = transport.recv(&mut buf);
                match result.status {
                    crate::transport::TransportStatus::Ok if result.processed > 0 => {
                        self.state = FsmState::Rx;
                        self.feed(&buf[..result.processed], now)
                    }
                    crate::transport::TransportStatus::Ok | crate::transport::TransportStatus::Timeout => {
                        // even with no new bytes, RTU silence may complete a
                        // frame that was fully buffered on a previous tick.
                        if self.rtu_frame_ready(now) {
                            self.state = FsmState::Dispatch;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                    crate::transport::TransportStatus::Transport => Err(Error::Transport),
                }
            }

            FsmState::Rx => {
                let mut buf = [0u8; 64];
                let result = transport.recv(&mut buf);
                match result.status {
                    crate::transport::TransportStatus::Ok if result.processed > 0 => {
                        self.feed(&buf[..result.processed], now)
                    }
                    _ => {
                        if self.rtu_frame_ready(now) {
                            self.state = FsmState::Dispatch;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                }
            }

            FsmState::Dispatch => {
                self.diag.counters.bump_rx_frame();
                let dispatched = self.dispatch(now)?;
                self.state = if dispatched {
                    FsmState::BuildReply
                } else {
                    self.reset_receiver();
                    FsmState::Idle
                };
                Ok(true)
            }

            FsmState::BuildReply => {
                if self.pending_broadcast || self.listen_only {
                    self.finish_request(now);
                    self.reset_receiver();
                    self.state = FsmState::Idle;
                    return Ok(true);
                }
                self.state = FsmState::Tx;
                Ok(true)
            }

            FsmState::Tx => {
                let result = transport.send(&self.tx_buf[self.tx_sent..self.tx_len]);
                match result.status {
                    crate::transport::TransportStatus::Transport => Err(Error::Transport),
                    _ => {
                        self.tx_sent += result.processed;
                        if self.tx_sent >= self.tx_len {
                            self.diag.counters.bump_tx_frame();
                            self.finish_request(now);
                            self.reset_receiver();
                            self.state = FsmState::Idle;
                        }
                        Ok(true)
                    }
                }
            }
        }
    }

    fn finish_request(&mut self, now: u64) {
        let fc = self.pending_pdu.as_ref().map(|p| p.function_code()).unwrap_or(0);
        self.diag.record(now, EventKind::ServerRequestComplete, fc, EventStatus::Ok);
        self.pending_pdu = None;
    }

    fn rtu_frame_ready(&self, now: u64) -> bool {
        match &self.mode {
            Mode::Rtu(rx) => !rx.is_empty() && matches!(rx.poll_silence(now), RtuPoll::FrameReady),
            Mode::Tcp(_) => false,
        }
    }

    fn reset_receiver(&mut self) {
        match &mut self.mode {
            Mode::Rtu(rx) => rx.reset(),
            Mode::Tcp(rx) => rx.reset(),
        }
    }

    fn feed(&mut self, bytes: &[u8], now: u64) -> Result<bool> {
        match &mut self.mode {
            Mode::Rtu(rx) => match rx.push_bytes(bytes, now) {
                RtuPoll::FramingError => {
                    self.diag.note_framing_error("RTU receive buffer overflow");
                    rx.reset();
                    self.state = FsmState::Idle;
                    Ok(true)
                }
                _ => Ok(true),
            },
            Mode::Tcp(rx) => match rx.push_bytes(bytes) {
                MbapPoll::FramingError => {
                    self.diag.note_framing_error("MBAP receive buffer overflow");
                    rx.reset();
                    self.state = FsmState::Idle;
                    Ok(true)
                }
                MbapPoll::NeedMore => Ok(true),
                MbapPoll::FrameReady(_) => {
                    self.state = FsmState::Dispatch;
                    Ok(true)
                }
            },
        }
    }

    /// Parses the buffered frame and executes the request against storage
    /// or a custom handler. Returns `Ok(true)` if a reply was staged into
    /// `tx_buf` (or no reply is required for a broadcast), `Ok(false)` if
    /// the frame was silently discarded (wrong unit, CRC/framing failure).
    fn dispatch(&mut self, now: u64) -> Result<bool> {
        let (unit_id, tid, pdu_bytes, pdu_len): (u8, u16, [u8; crate::pdu::MAX_PDU_SIZE + 1], usize) = {
            let mut scratch = [0u8; crate::pdu::MAX_PDU_SIZE + 1];
            match &mut self.mode {
                Mode::Rtu(rx) => {
                    let decoded = match rtu::decode_frame(rx.frame()) {
                        Ok(d) => d,
                        Err(Error::Crc { expected, actual }) => {
                            self.diag.note_crc_error(expected, actual);
                            return Ok(false);
                        }
                        Err(_) => {
                            self.diag.note_framing_error("RTU frame rejected");
                            return Ok(false);
                        }
                    };
                    let n = decoded.pdu.len().min(scratch.len());
                    scratch[..n].copy_from_slice(&decoded.pdu[..n]);
                    (decoded.unit_id, 0, scratch, n)
                }
                Mode::Tcp(rx) => {
                    let mut header_bytes = [0u8; mbap::HEADER_LEN];
                    header_bytes.copy_from_slice(rx.frame(mbap::HEADER_LEN));
                    let header = mbap::MbapHeader::parse(&header_bytes)?;
                    let total = mbap::HEADER_LEN + header.length as usize - 1;
                    let decoded = mbap::decode_frame(rx.frame(total))?;
                    let n = decoded.pdu.len().min(scratch.len());
                    scratch[..n].copy_from_slice(&decoded.pdu[..n]);
                    (decoded.header.unit_id, decoded.header.transaction_id, scratch, n)
                }
            }
        };

        if pdu_len == 0 {
            self.diag.note_framing_error("empty PDU");
            return Ok(false);
        }

        let is_rtu = matches!(self.mode, Mode::Rtu(_));
        self.dispatch_pdu(now, is_rtu, unit_id, tid, &pdu_bytes[..pdu_len])
    }

    /// Feeds an already-decoded ADU straight into dispatch, bypassing the
    /// framing/receive layer. Used by a front-end (e.g. a TCP listener
    /// fanning out several accepted sockets) that has already demultiplexed
    /// connections and decoded the ADU itself. `is_rtu_semantics` selects
    /// whether `unit_id == 0` is treated as a broadcast (RTU) or rejected
    /// (TCP); `tid` is ignored for RTU callers.
    ///
    /// Returns `Ok(Some(n))` with the reply staged in `out[..n]` when a
    /// reply is owed, `Ok(None)` when the request was a broadcast, was
    /// handled in listen-only mode, or was silently discarded.
    pub fn inject_adu(
        &mut self,
        now_ms: u64,
        is_rtu_semantics: bool,
        unit_id: u8,
        tid: u16,
        function_code: u8,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<Option<usize>> {
        if payload.len() > crate::pdu::MAX_PDU_SIZE {
            return Err(Error::InvalidRequest {
                reason: "injected ADU payload exceeds maximum PDU size",
            });
        }
        let mut pdu_bytes = [0u8; crate::pdu::MAX_PDU_SIZE + 1];
        pdu_bytes[0] = function_code;
        pdu_bytes[1..1 + payload.len()].copy_from_slice(payload);
        let pdu_len = 1 + payload.len();

        let replied = self.dispatch_pdu(now_ms, is_rtu_semantics, unit_id, tid, &pdu_bytes[..pdu_len])?;
        if !replied {
            // Silently discarded (wrong unit, dedup hit): nothing pending.
            return Ok(None);
        }
        if self.pending_broadcast || self.listen_only {
            self.finish_request(now_ms);
            return Ok(None);
        }
        if self.tx_len > out.len() {
            return Err(Error::InvalidArgument {
                reason: "destination buffer too small for injected reply",
            });
        }
        out[..self.tx_len].copy_from_slice(&self.tx_buf[..self.tx_len]);
        let n = self.tx_len;
        self.finish_request(now_ms);
        self.tx_len = 0;
        self.tx_sent = 0;
        Ok(Some(n))
    }

    /// Shared dispatch core for both the transport-framed path (`dispatch`)
    /// and `inject_adu`: identity/broadcast checks, dedup, handler/storage
    /// execution, and staging the reply frame (built with RTU or MBAP
    /// framing per `is_rtu`) into `tx_buf`.
    fn dispatch_pdu(&mut self, now: u64, is_rtu: bool, unit_id: u8, tid: u16, pdu_bytes: &[u8]) -> Result<bool> {
        let pdu_len = pdu_bytes.len();
        let broadcast = is_rtu && unit_id == 0;

        if !self.listen_only && !broadcast && unit_id != self.unit_id {
            return Ok(false);
        }
        if !is_rtu && unit_id == 0 {
            // Broadcasts are invalid on TCP (never valid outside RTU broadcast).
            return Ok(false);
        }

        if let Some(dedup) = &mut self.dedup {
            let fc = pdu_bytes[0];
            let hash = frame_hash(unit_id, fc, &pdu_bytes[1..pdu_len]);
            if dedup.check(hash, now) {
                self.diag.counters.bump_duplicate_suppressed();
                return Ok(false);
            }
            dedup.add(hash, now);
        }

        if broadcast {
            self.diag.counters.bump_broadcast();
        }

        let function_code = pdu_bytes[0];
        let payload = &pdu_bytes[1..pdu_len];

        let reply_pdu = self.execute(unit_id, function_code, payload);

        self.pending_unit = unit_id;
        self.pending_tid = tid;
        self.pending_broadcast = broadcast;

        let pdu = match reply_pdu {
            Ok(pdu) => pdu,
            Err(Error::Exception(code)) => {
                self.diag.counters.bump_exception_sent();
                Pdu::exception(function_code, code)
            }
            Err(_) => {
                self.diag.counters.bump_exception_sent();
                Pdu::exception(function_code, ExceptionCode::ServerFailure)
            }
        };
        self.pending_pdu = Some(pdu);
        if !broadcast && !self.listen_only {
            self.stage_reply(&pdu)?;
        }
        Ok(true)
    }

    fn stage_reply(&mut self, pdu: &Pdu) -> Result<()> {
        let mut frame = [0u8; crate::pdu::MAX_PDU_SIZE + 1];
        let n = pdu.write_frame(&mut frame)?;
        self.tx_len = match self.mode {
            Mode::Rtu(_) => rtu::encode_frame(self.pending_unit, &frame[..n], &mut self.tx_buf)?,
            Mode::Tcp(_) => mbap::encode_frame(self.pending_tid, self.pending_unit, &frame[..n], &mut self.tx_buf)?,
        };
        self.tx_sent = 0;
        Ok(())
    }

    fn execute(&mut self, unit_id: u8, function_code: u8, payload: &[u8]) -> Result<Pdu> {
        if let Some(handler) = self.find_handler(function_code) {
            return handler(unit_id, payload);
        }

        match function_code {
            pdu::FC_READ_COILS => self.read_bits(function_code, RegionKind::Coil, payload),
            pdu::FC_READ_DISCRETE_INPUTS => self.read_bits(function_code, RegionKind::DiscreteInput, payload),
            pdu::FC_READ_HOLDING_REGISTERS => {
                self.read_registers(function_code, RegionKind::HoldingRegister, payload)
            }
            pdu::FC_READ_INPUT_REGISTERS => self.read_registers(function_code, RegionKind::InputRegister, payload),
            pdu::FC_WRITE_SINGLE_COIL => self.write_single_coil(payload),
            pdu::FC_WRITE_SINGLE_REGISTER => self.write_single_register(payload),
            pdu::FC_WRITE_MULTIPLE_COILS => self.write_multiple_coils(payload),
            pdu::FC_WRITE_MULTIPLE_REGISTERS => self.write_multiple_registers(payload),
            pdu::FC_READ_WRITE_MULTIPLE_REGISTERS => self.read_write_multiple_registers(payload),
            _ => Err(Error::Exception(ExceptionCode::IllegalFunction)),
        }
    }

    fn read_bits(&mut self, function_code: u8, kind: RegionKind, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 4 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let start = read_u16_be(payload, 0);
        let count = read_u16_be(payload, 2);
        if count == 0 || count > 2000 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let idx = self
            .find_region(kind, start, count)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        let region = self.regions[idx].as_ref().unwrap();
        let offset = region.offset(start);
        let mut values = [false; 2000];
        match &region.backing {
            Backing::Bits(bits) => values[..count as usize].copy_from_slice(&bits[offset..offset + count as usize]),
            Backing::Registers(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        }
        pdu::reply::read_bits(function_code, &values[..count as usize])
            .map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }

    fn read_registers(&mut self, function_code: u8, kind: RegionKind, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 4 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let start = read_u16_be(payload, 0);
        let count = read_u16_be(payload, 2);
        if count == 0 || count > 125 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let idx = self
            .find_region(kind, start, count)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        let region = self.regions[idx].as_ref().unwrap();
        let offset = region.offset(start);
        let values = match &region.backing {
            Backing::Registers(regs) => &regs[offset..offset + count as usize],
            Backing::Bits(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        };
        pdu::reply::read_registers(function_code, values).map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }

    fn write_single_coil(&mut self, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 4 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let address = read_u16_be(payload, 0);
        let raw = read_u16_be(payload, 2);
        let value = pdu::decode_coil_value(raw).map_err(|_| Error::Exception(ExceptionCode::IllegalDataValue))?;
        let idx = self
            .find_region(RegionKind::Coil, address, 1)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        let region = self.regions[idx].as_mut().unwrap();
        if region.read_only {
            return Err(Error::Exception(ExceptionCode::IllegalFunction));
        }
        let offset = region.offset(address);
        match &mut region.backing {
            Backing::Bits(bits) => bits[offset] = value,
            Backing::Registers(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        }
        pdu::reply::echo(pdu::FC_WRITE_SINGLE_COIL, address, raw).map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }

    fn write_single_register(&mut self, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 4 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let address = read_u16_be(payload, 0);
        let value = read_u16_be(payload, 2);
        let idx = self
            .find_region(RegionKind::HoldingRegister, address, 1)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        let region = self.regions[idx].as_mut().unwrap();
        if region.read_only {
            return Err(Error::Exception(ExceptionCode::IllegalFunction));
        }
        let offset = region.offset(address);
        match &mut region.backing {
            Backing::Registers(regs) => regs[offset] = value,
            Backing::Bits(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        }
        pdu::reply::echo(pdu::FC_WRITE_SINGLE_REGISTER, address, value)
            .map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }

    fn write_multiple_coils(&mut self, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 5 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let start = read_u16_be(payload, 0);
        let count = read_u16_be(payload, 2);
        let byte_count = payload[4] as usize;
        if count == 0
            || count > 1968
            || byte_count != (count as usize).div_ceil(8)
            || payload.len() < 5 + byte_count
        {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let idx = self
            .find_region(RegionKind::Coil, start, count)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        {
            let region = self.regions[idx].as_ref().unwrap();
            if region.read_only {
                return Err(Error::Exception(ExceptionCode::IllegalFunction));
            }
        }
        let mut values = [false; 2000];
        unpack_bits(&payload[5..], count as usize, &mut values);

        let region = self.regions[idx].as_mut().unwrap();
        let offset = region.offset(start);
        match &mut region.backing {
            Backing::Bits(bits) => bits[offset..offset + count as usize].copy_from_slice(&values[..count as usize]),
            Backing::Registers(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        }
        pdu::reply::echo(pdu::FC_WRITE_MULTIPLE_COILS, start, count)
            .map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }

    fn write_multiple_registers(&mut self, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 5 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let start = read_u16_be(payload, 0);
        let count = read_u16_be(payload, 2);
        let byte_count = payload[4] as usize;
        if count == 0 || count > 123 || byte_count != count as usize * 2 || payload.len() < 5 + byte_count {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let idx = self
            .find_region(RegionKind::HoldingRegister, start, count)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        {
            let region = self.regions[idx].as_ref().unwrap();
            if region.read_only {
                return Err(Error::Exception(ExceptionCode::IllegalFunction));
            }
        }
        let mut values = [0u16; 123];
        for i in 0..count as usize {
            values[i] = read_u16_be(&payload[5..], i * 2);
        }

        let region = self.regions[idx].as_mut().unwrap();
        let offset = region.offset(start);
        match &mut region.backing {
            Backing::Registers(regs) => {
                regs[offset..offset + count as usize].copy_from_slice(&values[..count as usize])
            }
            Backing::Bits(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        }
        pdu::reply::echo(pdu::FC_WRITE_MULTIPLE_REGISTERS, start, count)
            .map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }

    /// FC 0x17: writes `write_count` registers starting at `write_start`,
    /// then reads back `read_count` registers starting at `read_start`. Both
    /// ranges are validated against registered regions before either the
    /// write or the read is applied, so a bad read range never leaves a
    /// partially-applied write behind.
    fn read_write_multiple_registers(&mut self, payload: &[u8]) -> Result<Pdu> {
        if payload.len() < 9 {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }
        let read_start = read_u16_be(payload, 0);
        let read_count = read_u16_be(payload, 2);
        let write_start = read_u16_be(payload, 4);
        let write_count = read_u16_be(payload, 6);
        let byte_count = payload[8] as usize;
        if read_count == 0
            || read_count > 125
            || write_count == 0
            || write_count > 121
            || byte_count != write_count as usize * 2
            || payload.len() < 9 + byte_count
        {
            return Err(Error::Exception(ExceptionCode::IllegalDataValue));
        }

        let write_idx = self
            .find_region(RegionKind::HoldingRegister, write_start, write_count)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        let read_idx = self
            .find_region(RegionKind::HoldingRegister, read_start, read_count)
            .ok_or(Error::Exception(ExceptionCode::IllegalDataAddress))?;
        if self.regions[write_idx].as_ref().unwrap().read_only {
            return Err(Error::Exception(ExceptionCode::IllegalFunction));
        }

        let mut values = [0u16; 121];
        for i in 0..write_count as usize {
            values[i] = read_u16_be(&payload[9..], i * 2);
        }

        let write_region = self.regions[write_idx].as_mut().unwrap();
        let write_offset = write_region.offset(write_start);
        match &mut write_region.backing {
            Backing::Registers(regs) => {
                regs[write_offset..write_offset + write_count as usize].copy_from_slice(&values[..write_count as usize])
            }
            Backing::Bits(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        }

        let read_region = self.regions[read_idx].as_ref().unwrap();
        let read_offset = read_region.offset(read_start);
        let read_values = match &read_region.backing {
            Backing::Registers(regs) => &regs[read_offset..read_offset + read_count as usize],
            Backing::Bits(_) => return Err(Error::Exception(ExceptionCode::IllegalDataAddress)),
        };
        pdu::reply::read_registers(pdu::FC_READ_WRITE_MULTIPLE_REGISTERS, read_values)
            .map_err(|_| Error::Exception(ExceptionCode::ServerFailure))
    }
}
