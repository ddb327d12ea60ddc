//! Descriptor slot table: a fixed array of descriptor-level state that
//! sockets claim lazily. Slots are the only structure external pollers
//! scan; every field is atomic so a scan never has to resolve (and thus
//! never races with the teardown of) the owning record.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;

use crate::handle::SocketId;
use crate::sys::{Fd, INVALID_FD};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SocketFlags: u32 {
        const BLOCKING           = 0x0001;
        const REUSE_ADDR         = 0x0002;
        const REUSE_PORT         = 0x0004;
        /// Nagle enabled (TCP_NODELAY off).
        const TCP_DELAY          = 0x0008;
        /// Readiness is tracked by an external event loop; streams must
        /// not issue their own kernel reads on availability checks.
        const POLLED             = 0x0010;
        const CONNECTION_PENDING = 0x0020;
        const ERROR_PENDING      = 0x0040;
        /// A hangup event has already been posted for this descriptor.
        const HANGUP_PENDING     = 0x0080;
        /// A partial send left bytes in the out-buffer; retry on
        /// writability.
        const REFLUSH            = 0x0100;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    NotConnected = 0,
    Connecting = 1,
    Connected = 2,
    Listening = 3,
    Disconnected = 4,
}

impl SocketState {
    fn from_raw(raw: u8) -> SocketState {
        match raw {
            1 => SocketState::Connecting,
            2 => SocketState::Connected,
            3 => SocketState::Listening,
            4 => SocketState::Disconnected,
            _ => SocketState::NotConnected,
        }
    }
}

pub(crate) struct Slot {
    /// Raw id of the owning record, 0 when free. The claim CAS goes
    /// through this field.
    object: AtomicU64,
    fd: AtomicI32,
    flags: AtomicU32,
    state: AtomicU8,
    /// Timestamp of the most recent state-change notification, used to
    /// debounce edge-triggered event delivery. Reads reset it so the next
    /// poll re-emits the data-available edge.
    last_event: AtomicU64,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            object: AtomicU64::new(0),
            fd: AtomicI32::new(INVALID_FD),
            flags: AtomicU32::new(0),
            state: AtomicU8::new(SocketState::NotConnected as u8),
            last_event: AtomicU64::new(0),
        }
    }

    pub(crate) fn object(&self) -> Option<SocketId> {
        SocketId::from_raw(self.object.load(Ordering::Acquire))
    }

    pub(crate) fn fd(&self) -> Fd {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn set_fd(&self, fd: Fd) {
        self.fd.store(fd, Ordering::Release);
    }

    pub(crate) fn state(&self) -> SocketState {
        SocketState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn flags(&self) -> SocketFlags {
        SocketFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn has_flag(&self, flag: SocketFlags) -> bool {
        self.flags().contains(flag)
    }

    pub(crate) fn set_flag(&self, flag: SocketFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn set_last_event(&self, when: u64) {
        self.last_event.store(when, Ordering::Release);
    }

    /// Reset descriptor-level state and return the slot to the free pool.
    /// `object` goes last so a concurrent claimer cannot observe stale
    /// fields.
    pub(crate) fn release(&self) {
        self.fd.store(INVALID_FD, Ordering::Release);
        self.flags.store(0, Ordering::Release);
        self.state
            .store(SocketState::NotConnected as u8, Ordering::Release);
        self.last_event.store(0, Ordering::Release);
        self.object.store(0, Ordering::Release);
    }
}

pub(crate) struct SlotTable {
    slots: Box<[Slot]>,
    cursor: AtomicU32,
}

impl SlotTable {
    pub(crate) fn new(capacity: usize) -> Self {
        SlotTable {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            cursor: AtomicU32::new(0),
        }
    }

    /// Claim a free slot for `id`: advance the shared cursor modulo
    /// capacity and CAS `object` from 0. O(1) on average; gives up after
    /// two full sweeps so a full table is an error, not a livelock.
    pub(crate) fn claim(&self, id: SocketId) -> Option<usize> {
        let len = self.slots.len() as u32;
        if len == 0 {
            return None;
        }
        for _ in 0..2 * len {
            let base = (self.cursor.fetch_add(1, Ordering::Relaxed) % len) as usize;
            let slot = &self.slots[base];
            if slot.object.load(Ordering::Acquire) != 0 {
                continue;
            }
            if slot
                .object
                .compare_exchange(0, id.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.fd.store(INVALID_FD, Ordering::Release);
                slot.flags.store(0, Ordering::Release);
                slot.state
                    .store(SocketState::NotConnected as u8, Ordering::Release);
                slot.last_event.store(0, Ordering::Release);
                return Some(base);
            }
        }
        None
    }

    pub(crate) fn slot(&self, base: usize) -> Option<&Slot> {
        self.slots.get(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> SocketId {
        SocketId::from_raw(raw).unwrap()
    }

    #[test]
    fn claim_and_release() {
        let table = SlotTable::new(2);
        let a = table.claim(id(0x1_0000_0001)).unwrap();
        let b = table.claim(id(0x1_0000_0002)).unwrap();
        assert_ne!(a, b);
        assert!(table.claim(id(0x1_0000_0003)).is_none());

        table.slot(a).unwrap().release();
        let c = table.claim(id(0x1_0000_0003)).unwrap();
        assert_eq!(c, a);
        assert_eq!(table.slot(c).unwrap().object(), Some(id(0x1_0000_0003)));
    }

    #[test]
    fn claim_resets_descriptor_state() {
        let table = SlotTable::new(1);
        let base = table.claim(id(0x1_0000_0001)).unwrap();
        let slot = table.slot(base).unwrap();
        slot.set_fd(42);
        slot.set_state(SocketState::Connected);
        slot.set_flag(SocketFlags::BLOCKING, true);
        slot.release();

        let base = table.claim(id(0x1_0000_0002)).unwrap();
        let slot = table.slot(base).unwrap();
        assert_eq!(slot.fd(), INVALID_FD);
        assert_eq!(slot.state(), SocketState::NotConnected);
        assert!(!slot.has_flag(SocketFlags::BLOCKING));
    }

    #[test]
    fn concurrent_claims_are_unique() {
        use std::sync::Arc;

        let table = Arc::new(SlotTable::new(64));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let mut claimed = Vec::new();
                for i in 0..16u64 {
                    let raw = (t << 8) | (i + 1) | 0x1_0000_0000;
                    claimed.push(table.claim(id(raw)).unwrap());
                }
                claimed
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 64);
    }
}
