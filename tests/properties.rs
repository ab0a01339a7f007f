//! Universal invariants from the protocol specification's testable
//! properties: codec round-trips, CRC idempotence, MBAP length bookkeeping,
//! pool exhaustion, broadcast silence, and duplicate suppression.

mod common;

use std::sync::atomic::{AtomicU8, Ordering};

use common::{make_pair, StubTransport};
use modbus_core::crc::append_crc;
use modbus_core::pdu::{self, reply, request, response};
use modbus_core::rtu::RtuTiming;
use modbus_core::{
    mbap, Backing, ClientFsm, ClientRequest, Pdu, Priority, RegionKind, Result, ServerFsm,
};
use proptest::prelude::*;

const RTU_TIMING: RtuTiming = RtuTiming::custom(750, 1750);

fn noop_callback(_status: Result<()>, _response: Option<&Pdu>, _ctx: usize) {}

/// `(count, values)` where `values.len() == count`, for the register-read
/// family (1..=125 per the wire-format limit).
fn register_values() -> impl Strategy<Value = (u16, Vec<u16>)> {
    (1u16..=125).prop_flat_map(|count| (Just(count), prop::collection::vec(any::<u16>(), count as usize)))
}

/// `(count, values)` for the bit-read family (1..=2000).
fn bit_values() -> impl Strategy<Value = (u16, Vec<bool>)> {
    (1u16..=2000).prop_flat_map(|count| (Just(count), prop::collection::vec(any::<bool>(), count as usize)))
}

proptest! {
    // P(round-trip, registers): reply::read_registers then
    // response::read_registers recovers exactly the values that went in.
    #[test]
    fn roundtrip_register_reply((count, values) in register_values()) {
        let pdu = reply::read_registers(pdu::FC_READ_HOLDING_REGISTERS, &values).unwrap();
        let parsed = response::read_registers(&pdu, count).unwrap();
        prop_assert_eq!(parsed.as_slice(), values.as_slice());
    }

    // P(round-trip, bits): same property for the coil/discrete family.
    #[test]
    fn roundtrip_bit_reply((count, values) in bit_values()) {
        let pdu = reply::read_bits(pdu::FC_READ_COILS, &values).unwrap();
        let parsed = response::read_bits(&pdu, count).unwrap();
        prop_assert_eq!(parsed.as_slice(), values.as_slice());
    }

    // P(round-trip, write echo): a write-single-register reply parses back
    // as a no-op confirmation of exactly the fields that were sent.
    #[test]
    fn roundtrip_write_single_register_echo(address: u16, value: u16) {
        let req = request::write_single_register(address, value).unwrap();
        let echoed = reply::echo(pdu::FC_WRITE_SINGLE_REGISTER, address, value).unwrap();
        prop_assert!(response::write_echo(&echoed, req.payload()).is_ok());
    }

    // P(CRC idempotence): any payload of length 1..254 round-trips through
    // its own CRC-16 trailer.
    #[test]
    fn crc_idempotence(body in prop::collection::vec(any::<u8>(), 1..254)) {
        let mut frame = vec![0u8; body.len() + 2];
        frame[..body.len()].copy_from_slice(&body);
        append_crc(&body, &mut frame[body.len()..]);
        prop_assert!(modbus_core::crc::crc16_validate(&frame).is_ok());
    }

    // P(CRC idempotence, negative): flipping any single bit in the body
    // breaks validation (the trailer no longer matches).
    #[test]
    fn crc_detects_single_bit_flip(
        (body, flip_byte, flip_bit) in prop::collection::vec(any::<u8>(), 1..254)
            .prop_flat_map(|body| {
                let len = body.len();
                (Just(body), 0..len, 0u8..8)
            })
    ) {
        let mut frame = vec![0u8; body.len() + 2];
        frame[..body.len()].copy_from_slice(&body);
        append_crc(&body, &mut frame[body.len()..]);
        frame[flip_byte] ^= 1 << flip_bit;
        prop_assert!(modbus_core::crc::crc16_validate(&frame).is_err());
    }

    // P(MBAP length): for any emitted TCP frame, `length == 1 + pdu_len`
    // and the total frame length equals `6 + length`.
    #[test]
    fn mbap_length_invariant(tid: u16, unit: u8, pdu_bytes in prop::collection::vec(any::<u8>(), 1..=253)) {
        let mut out = [0u8; 300];
        let total = mbap::encode_frame(tid, unit, &pdu_bytes, &mut out).unwrap();
        let mut header_bytes = [0u8; mbap::HEADER_LEN];
        header_bytes.copy_from_slice(&out[..mbap::HEADER_LEN]);
        let header = mbap::MbapHeader::parse(&header_bytes).unwrap();
        prop_assert_eq!(header.length as usize, 1 + pdu_bytes.len());
        prop_assert_eq!(total, 6 + header.length as usize);
    }

    // P(broadcast silence): any valid broadcast write applies to storage
    // and elicits zero reply bytes, for any address/value pair in range.
    #[test]
    fn broadcast_write_applies_silently(address in 0u16..1000, value: u16) {
        let mut holding = vec![0u16; 1000];
        let mut server = ServerFsm::new_rtu(0x11, false, RTU_TIMING, 5_000);
        server
            .add_storage(0, 1000, RegionKind::HoldingRegister, false, Backing::Registers(&mut holding))
            .unwrap();

        let mut client = ClientFsm::<1>::new_rtu(RTU_TIMING, 2_000, 5_000);
        client
            .submit(ClientRequest {
                unit_id: 0,
                pdu: request::write_single_register(address, value).unwrap(),
                timeout_ms: 500,
                max_retries: 0,
                backoff_ms: 0,
                priority: Priority::Normal,
                callback: noop_callback,
                user_ctx: 0,
            })
            .unwrap();

        let (mut client_t, mut server_t, clock) = make_pair();
        client.poll(&mut client_t).unwrap();
        prop_assert_eq!(client.pending(), 0, "broadcast must complete on the first poll");

        for _ in 0..10 {
            server.poll(&mut server_t).unwrap();
            clock.set(clock.get() + 3);
        }

        prop_assert_eq!(holding[address as usize], value);
        prop_assert_eq!(server_t.outbound_len(), 0);
    }
}

// --- Pool exhaustion ---------------------------------------------------

fn exhausts_pool<const N: usize>() {
    let mut client = ClientFsm::<N>::new_tcp(2_000, 5_000);
    for _ in 0..N {
        let outcome = client.submit(ClientRequest {
            unit_id: 1,
            pdu: request::read_holding_registers(0, 1).unwrap(),
            timeout_ms: 1_000,
            max_retries: 0,
            backoff_ms: 0,
            priority: Priority::Normal,
            callback: noop_callback,
            user_ctx: 0,
        });
        assert!(outcome.is_ok(), "the {N}-slot pool should accept {N} outstanding submissions");
    }
    assert_eq!(client.pending(), N);

    let overflow = client.submit(ClientRequest {
        unit_id: 1,
        pdu: request::read_holding_registers(0, 1).unwrap(),
        timeout_ms: 1_000,
        max_retries: 0,
        backoff_ms: 0,
        priority: Priority::Normal,
        callback: noop_callback,
        user_ctx: 0,
    });
    assert!(matches!(overflow, Err(modbus_core::Error::NoResources)));
    assert_eq!(client.pending(), N, "a rejected submission must not occupy a slot");
}

#[test]
fn pool_exhaustion_one_slot() {
    exhausts_pool::<1>();
}

#[test]
fn pool_exhaustion_three_slots() {
    exhausts_pool::<3>();
}

#[test]
fn pool_exhaustion_eight_slots() {
    exhausts_pool::<8>();
}

// --- Duplicate suppression ----------------------------------------------

static DISPATCH_COUNT: AtomicU8 = AtomicU8::new(0);

fn counting_handler(_unit_id: u8, payload: &[u8]) -> Result<Pdu> {
    DISPATCH_COUNT.fetch_add(1, Ordering::SeqCst);
    Pdu::from_slice(pdu::FC_WRITE_SINGLE_REGISTER, payload)
}

#[test]
fn duplicate_frame_is_suppressed_within_window() {
    DISPATCH_COUNT.store(0, Ordering::SeqCst);

    let mut server = ServerFsm::new_rtu(0x11, false, RTU_TIMING, 5_000);
    server.set_handler(pdu::FC_WRITE_SINGLE_REGISTER, counting_handler).unwrap();
    server.enable_dedup(500);

    let body = [0x11u8, 0x06, 0x00, 0x01, 0x00, 0x03];
    let mut frame = [0u8; 8];
    frame[..6].copy_from_slice(&body);
    append_crc(&body, &mut frame[6..]);

    let mut transport = StubTransport::new();
    transport.inbox.write(&frame);
    server.poll(&mut transport).unwrap();
    transport.advance(2);
    server.poll(&mut transport).unwrap();
    assert_eq!(DISPATCH_COUNT.load(Ordering::SeqCst), 1);

    // Resend the identical frame well inside the 500ms dedup window.
    transport.advance(100);
    transport.inbox.write(&frame);
    server.poll(&mut transport).unwrap();
    transport.advance(2);
    server.poll(&mut transport).unwrap();

    assert_eq!(DISPATCH_COUNT.load(Ordering::SeqCst), 1, "a duplicate must never reach the dispatcher");
    assert_eq!(server.diag.counters.duplicates_suppressed, 1);
}

#[test]
fn repeat_outside_window_is_not_suppressed() {
    DISPATCH_COUNT.store(0, Ordering::SeqCst);

    let mut server = ServerFsm::new_rtu(0x11, false, RTU_TIMING, 5_000);
    server.set_handler(pdu::FC_WRITE_SINGLE_REGISTER, counting_handler).unwrap();
    server.enable_dedup(50);

    let body = [0x11u8, 0x06, 0x00, 0x01, 0x00, 0x03];
    let mut frame = [0u8; 8];
    frame[..6].copy_from_slice(&body);
    append_crc(&body, &mut frame[6..]);

    let mut transport = StubTransport::new();
    transport.inbox.write(&frame);
    server.poll(&mut transport).unwrap();
    transport.advance(2);
    server.poll(&mut transport).unwrap();
    assert_eq!(DISPATCH_COUNT.load(Ordering::SeqCst), 1);

    // This time the resend happens well after the 50ms window ages out.
    transport.advance(200);
    transport.inbox.write(&frame);
    server.poll(&mut transport).unwrap();
    transport.advance(2);
    server.poll(&mut transport).unwrap();

    assert_eq!(DISPATCH_COUNT.load(Ordering::SeqCst), 2);
    assert_eq!(server.diag.counters.duplicates_suppressed, 0);
}
