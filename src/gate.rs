//! Multi-connection TCP gate: fans out a fixed number of independent
//! connections behind one façade, so a caller juggling several TCP slaves
//! doesn't need one `ClientFsm` per socket. Each slot owns its own transport
//! and transaction pool; a failure in one slot never touches the others.

use crate::client::{ClientFsm, Request, TxHandle};
use crate::error::{Error, Result};
use crate::transport::Transport;

struct Slot<'t, const POOL: usize> {
    transport: &'t mut dyn Transport,
    client: ClientFsm<POOL>,
    in_use: bool,
}

/// Fans out `SLOTS` independent TCP connections, each with its own
/// transaction pool of size `POOL`. A failure on one slot never affects
/// the others.
pub struct TcpGate<'t, const SLOTS: usize, const POOL: usize> {
    slots: [Option<Slot<'t, POOL>>; SLOTS],
}

impl<'t, const SLOTS: usize, const POOL: usize> TcpGate<'t, SLOTS, POOL> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Adds a connection, returning its slot index.
    pub fn add(&mut self, transport: &'t mut dyn Transport, watchdog_ms: u64, idle_threshold_ms: u64) -> Result<usize> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::NoResources)?;
        self.slots[idx] = Some(Slot {
            transport,
            client: ClientFsm::new_tcp(watchdog_ms, idle_threshold_ms),
            in_use: true,
        });
        Ok(idx)
    }

    pub fn remove(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            if let Some(slot) = s {
                slot.client.cancel_all();
            }
            *s = None;
        }
    }

    pub fn submit(&mut self, slot: usize, req: Request) -> Result<TxHandle> {
        let s = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.as_mut())
            .filter(|s| s.in_use)
            .ok_or(Error::InvalidArgument {
                reason: "no connection in that slot",
            })?;
        s.client.submit(req)
    }

    /// Polls every active slot once. A transport error on one slot is
    /// swallowed after being reported via that slot's own diagnostics; it
    /// does not abort polling the remaining slots.
    pub fn poll_all(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            let _ = slot.client.poll(slot.transport);
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl<'t, const SLOTS: usize, const POOL: usize> Default for TcpGate<'t, SLOTS, POOL> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::ChannelTransport;

    #[test]
    fn add_and_remove_slots() {
        let mut t1 = ChannelTransport::new();
        let mut t2 = ChannelTransport::new();
        let mut gate: TcpGate<2, 4> = TcpGate::new();
        let s1 = gate.add(&mut t1, 2000, 5000).unwrap();
        let s2 = gate.add(&mut t2, 2000, 5000).unwrap();
        assert_ne!(s1, s2);
        assert_eq!(gate.slot_count(), 2);
        gate.remove(s1);
        assert_eq!(gate.slot_count(), 1);
    }

    #[test]
    fn add_fails_when_full() {
        let mut t1 = ChannelTransport::new();
        let mut gate: TcpGate<1, 4> = TcpGate::new();
        gate.add(&mut t1, 2000, 5000).unwrap();
        let mut t2 = ChannelTransport::new();
        assert!(matches!(gate.add(&mut t2, 2000, 5000), Err(Error::NoResources)));
    }
}
