//! Shared harness for the integration tests: an in-memory transport pair
//! that lets a `ClientFsm` and a `ServerFsm` talk to each other over two
//! plain `RingBuffer`s, plus a couple of small helpers for driving both
//! FSMs to completion under a shared simulated clock.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use modbus_core::ring::RingBuffer;
use modbus_core::{IoResult, Transport};

const LINK_CAPACITY: usize = 512;

/// One end of a loopback link: writes land in `tx`, reads come from `rx`.
/// Both ends share a single simulated clock so RTU silence timing behaves
/// the same from either side.
pub struct LinkTransport {
    tx: Rc<RefCell<RingBuffer<LINK_CAPACITY>>>,
    rx: Rc<RefCell<RingBuffer<LINK_CAPACITY>>>,
    clock: Rc<Cell<u64>>,
}

impl Transport for LinkTransport {
    fn send(&mut self, bytes: &[u8]) -> IoResult {
        IoResult::ok(self.tx.borrow_mut().write(bytes))
    }

    fn recv(&mut self, buf: &mut [u8]) -> IoResult {
        let n = self.rx.borrow_mut().read(buf);
        if n == 0 {
            IoResult::timeout()
        } else {
            IoResult::ok(n)
        }
    }

    fn now(&self) -> u64 {
        self.clock.get()
    }
}

impl LinkTransport {
    pub fn inject(&mut self, bytes: &[u8]) {
        self.rx.borrow_mut().write(bytes);
    }

    pub fn drain_outbound(&mut self, out: &mut [u8]) -> usize {
        self.tx.borrow_mut().read(out)
    }

    pub fn outbound_len(&self) -> usize {
        self.tx.borrow().size()
    }
}

/// Builds a connected client/server transport pair plus the shared clock
/// used to advance both sides in lockstep.
pub fn make_pair() -> (LinkTransport, LinkTransport, Rc<Cell<u64>>) {
    let client_to_server = Rc::new(RefCell::new(RingBuffer::<LINK_CAPACITY>::new().unwrap()));
    let server_to_client = Rc::new(RefCell::new(RingBuffer::<LINK_CAPACITY>::new().unwrap()));
    let clock = Rc::new(Cell::new(0u64));
    let client = LinkTransport {
        tx: client_to_server.clone(),
        rx: server_to_client.clone(),
        clock: clock.clone(),
    };
    let server = LinkTransport {
        tx: server_to_client,
        rx: client_to_server,
        clock: clock.clone(),
    };
    (client, server, clock)
}

/// A transport with no peer at all: every `recv` reports `Timeout`, useful
/// for driving a client FSM directly against hand-crafted wire bytes.
pub struct StubTransport {
    pub inbox: RingBuffer<LINK_CAPACITY>,
    pub outbox: RingBuffer<LINK_CAPACITY>,
    pub clock_ms: u64,
}

impl StubTransport {
    pub fn new() -> Self {
        Self {
            inbox: RingBuffer::new().unwrap(),
            outbox: RingBuffer::new().unwrap(),
            clock_ms: 0,
        }
    }

    pub fn advance(&mut self, ms: u64) {
        self.clock_ms += ms;
    }
}

impl Transport for StubTransport {
    fn send(&mut self, bytes: &[u8]) -> IoResult {
        IoResult::ok(self.outbox.write(bytes))
    }

    fn recv(&mut self, buf: &mut [u8]) -> IoResult {
        let n = self.inbox.read(buf);
        if n == 0 {
            IoResult::timeout()
        } else {
            IoResult::ok(n)
        }
    }

    fn now(&self) -> u64 {
        self.clock_ms
    }
}
