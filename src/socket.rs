//! Socket records and the operations shared by every transport: lifetime
//! management through the handle registry, lazy descriptor creation,
//! close semantics and the connection state poller.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::address::{AddressFamily, NetworkAddress};
use crate::api::Transport;
use crate::errors::Error;
use crate::handle::{HandleMap, SocketId};
use crate::network;
use crate::serial_cell::SerialCell;
use crate::slot::{Slot, SlotTable, SocketFlags, SocketState};
use crate::stream::SocketStream;
use crate::sys::{self, Fd, INVALID_FD};

pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;
pub(crate) const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Registry plus slot table. One per initialized module; records keep
/// their own reference so teardown order never strands a descriptor.
pub(crate) struct SocketSystem {
    pub(crate) map: HandleMap,
    pub(crate) slots: SlotTable,
}

impl SocketSystem {
    pub(crate) fn new(max_sockets: usize) -> Self {
        SocketSystem {
            map: HandleMap::new(max_sockets + max_sockets.min(256)),
            slots: SlotTable::new(max_sockets),
        }
    }
}

/// Guard returned by [`acquire`]. Keeps the record alive while held; the
/// ref/unref pair of hand-rolled registries collapses into cloning and
/// dropping this guard.
pub type SocketRef = Arc<Socket>;

/// A socket record. Owned by the registry; reached through a [`SocketId`].
pub struct Socket {
    id: SocketId,
    system: Arc<SocketSystem>,
    transport: &'static dyn Transport,
    /// Slot index in the descriptor table, or -1 when none is claimed.
    base: AtomicI32,
    /// 0 = unset, then fixed at first descriptor creation.
    family: AtomicU8,
    address_local: Mutex<Option<NetworkAddress>>,
    address_remote: Mutex<Option<NetworkAddress>>,
    pub(crate) buffer_in: SerialCell<Box<[u8]>>,
    pub(crate) buffer_out: SerialCell<Box<[u8]>>,
    offset_read_in: AtomicUsize,
    offset_write_in: AtomicUsize,
    offset_write_out: AtomicUsize,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    stream_bound: AtomicBool,
}

impl Socket {
    pub(crate) fn new(
        id: SocketId,
        system: Arc<SocketSystem>,
        transport: &'static dyn Transport,
    ) -> Socket {
        Socket {
            id,
            system,
            transport,
            base: AtomicI32::new(-1),
            family: AtomicU8::new(0),
            address_local: Mutex::new(None),
            address_remote: Mutex::new(None),
            buffer_in: SerialCell::new(vec![0u8; READ_BUFFER_SIZE].into_boxed_slice()),
            buffer_out: SerialCell::new(vec![0u8; WRITE_BUFFER_SIZE].into_boxed_slice()),
            offset_read_in: AtomicUsize::new(0),
            offset_write_in: AtomicUsize::new(0),
            offset_write_out: AtomicUsize::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            stream_bound: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub(crate) fn system(&self) -> &SocketSystem {
        &self.system
    }

    pub(crate) fn transport(&self) -> &'static dyn Transport {
        self.transport
    }

    pub(crate) fn slot(&self) -> Option<&Slot> {
        let base = self.base.load(Ordering::Acquire);
        if base < 0 {
            None
        } else {
            self.system.slots.slot(base as usize)
        }
    }

    /// Lazily claim a descriptor slot.
    pub(crate) fn claim_slot(&self) -> Option<i32> {
        let base = self.base.load(Ordering::Acquire);
        if base >= 0 {
            return Some(base);
        }
        let base = self.system.slots.claim(self.id)? as i32;
        self.base.store(base, Ordering::Release);
        Some(base)
    }

    /// Lazily create the kernel descriptor for `family`. The family is
    /// fixed by the first creation; asking for another one afterwards is
    /// a caller bug.
    pub(crate) fn create_fd(&self, family: AddressFamily) -> Fd {
        if self.claim_slot().is_none() {
            error!(
                "unable to allocate descriptor slot for socket {}: {}",
                self.id,
                Error::Exhausted
            );
            return INVALID_FD;
        }
        let Some(slot) = self.slot() else {
            return INVALID_FD;
        };

        if slot.fd() != INVALID_FD {
            if let Some(have) = self.family() {
                if have != family {
                    let err = Error::FamilyMismatch { have, want: family };
                    error!(
                        "trying to switch family on existing socket {} (fd {}): {}",
                        self.id,
                        slot.fd(),
                        err
                    );
                    debug_assert!(false, "{err}");
                    return INVALID_FD;
                }
            }
        }

        if slot.fd() == INVALID_FD {
            self.transport.open(self, family);
            if slot.fd() != INVALID_FD {
                self.set_family(family);
                let flags = slot.flags();
                self.set_blocking_flag(flags.contains(SocketFlags::BLOCKING));
                self.set_reuse_address_flag(flags.contains(SocketFlags::REUSE_ADDR));
                self.set_reuse_port_flag(flags.contains(SocketFlags::REUSE_PORT));
            }
        }

        slot.fd()
    }

    pub(crate) fn family(&self) -> Option<AddressFamily> {
        match self.family.load(Ordering::Acquire) {
            1 => Some(AddressFamily::Ipv4),
            2 => Some(AddressFamily::Ipv6),
            _ => None,
        }
    }

    pub(crate) fn set_family(&self, family: AddressFamily) {
        let raw = match family {
            AddressFamily::Ipv4 => 1,
            AddressFamily::Ipv6 => 2,
        };
        self.family.store(raw, Ordering::Release);
    }

    pub(crate) fn offset_read_in(&self) -> usize {
        self.offset_read_in.load(Ordering::Relaxed)
    }

    pub(crate) fn set_offset_read_in(&self, offset: usize) {
        self.offset_read_in.store(offset, Ordering::Relaxed);
    }

    pub(crate) fn offset_write_in(&self) -> usize {
        self.offset_write_in.load(Ordering::Relaxed)
    }

    pub(crate) fn set_offset_write_in(&self, offset: usize) {
        self.offset_write_in.store(offset, Ordering::Relaxed);
    }

    pub(crate) fn offset_write_out(&self) -> usize {
        self.offset_write_out.load(Ordering::Relaxed)
    }

    pub(crate) fn set_offset_write_out(&self, offset: usize) {
        self.offset_write_out.store(offset, Ordering::Relaxed);
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes_read(&self, count: u64) {
        self.bytes_read.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_written(&self, count: u64) {
        self.bytes_written.fetch_add(count, Ordering::Relaxed);
    }

    /// Bytes currently held in the in-ring.
    pub(crate) fn buffered_in(&self) -> usize {
        let read = self.offset_read_in();
        let write = self.offset_write_in();
        if write >= read {
            write - read
        } else {
            (READ_BUFFER_SIZE - read) + write
        }
    }

    /// Buffered input plus whatever the kernel reports as readable.
    pub(crate) fn available_nonblock_read(&self) -> usize {
        let available = self.slot().map_or(0, |slot| sys::available_fd(slot.fd()));
        self.buffered_in() + if available > 0 { available as usize } else { 0 }
    }

    pub(crate) fn address_local(&self) -> Option<NetworkAddress> {
        *self.address_local.lock().unwrap()
    }

    pub(crate) fn address_remote(&self) -> Option<NetworkAddress> {
        *self.address_remote.lock().unwrap()
    }

    pub(crate) fn set_address_remote(&self, address: Option<NetworkAddress>) {
        *self.address_remote.lock().unwrap() = address;
    }

    /// Capture the descriptor's local address after bind/connect/accept.
    pub(crate) fn store_address_local(&self) {
        let Some(slot) = self.slot() else {
            return;
        };
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                slot.fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            warn!(
                "unable to get local address for socket {} (fd {}): {}",
                self.id,
                slot.fd(),
                io::Error::last_os_error()
            );
            return;
        }
        if let Some(address) = NetworkAddress::from_raw(&storage, len) {
            *self.address_local.lock().unwrap() = Some(address);
        }
    }

    pub(crate) fn set_blocking_flag(&self, block: bool) {
        if self.claim_slot().is_none() {
            return;
        }
        let Some(slot) = self.slot() else {
            return;
        };
        slot.set_flag(SocketFlags::BLOCKING, block);
        if slot.fd() != INVALID_FD {
            sys::set_blocking_fd(slot.fd(), block);
        }
    }

    pub(crate) fn set_reuse_address_flag(&self, reuse: bool) {
        if self.claim_slot().is_none() {
            return;
        }
        let Some(slot) = self.slot() else {
            return;
        };
        slot.set_flag(SocketFlags::REUSE_ADDR, reuse);
        if slot.fd() != INVALID_FD {
            if let Err(err) = sys::set_option(
                slot.fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                reuse as libc::c_int,
            ) {
                warn!(
                    "unable to set reuse address option on socket {} (fd {}): {}",
                    self.id,
                    slot.fd(),
                    err
                );
            }
        }
    }

    pub(crate) fn set_reuse_port_flag(&self, reuse: bool) {
        if self.claim_slot().is_none() {
            return;
        }
        let Some(slot) = self.slot() else {
            return;
        };
        slot.set_flag(SocketFlags::REUSE_PORT, reuse);
        if slot.fd() != INVALID_FD {
            if let Err(err) = sys::set_option(
                slot.fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                reuse as libc::c_int,
            ) {
                warn!(
                    "unable to set reuse port option on socket {} (fd {}): {}",
                    self.id,
                    slot.fd(),
                    err
                );
            }
        }
    }

    /// Flush the out-buffer through the transport when there is anything
    /// to flush and the connection is up.
    pub(crate) fn do_flush(&self) {
        if self.offset_write_out() == 0 {
            return;
        }
        let Some(slot) = self.slot() else {
            return;
        };
        if slot.state() != SocketState::Connected {
            return;
        }
        self.transport.buffer_write(self);
    }

    /// Drive the record into the closed state: detach the slot first so
    /// post-close operations short-circuit on base == -1, then reset the
    /// slot, then tear the descriptor down. The record itself lives on
    /// until its last guard drops.
    pub(crate) fn close_record(&self) {
        let mut fd = INVALID_FD;
        let base = self.base.swap(-1, Ordering::AcqRel);
        if base >= 0 {
            if let Some(slot) = self.system.slots.slot(base as usize) {
                fd = slot.fd();
                slot.release();
            }
        }

        debug!("closing socket {} (fd {})", self.id, fd);

        *self.address_local.lock().unwrap() = None;
        *self.address_remote.lock().unwrap() = None;

        if fd != INVALID_FD {
            sys::set_blocking_fd(fd, false);
            sys::close_fd(fd);
        }
    }

    pub(crate) fn bind_stream(&self) -> bool {
        self.stream_bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_stream(&self) {
        self.stream_bound.store(false, Ordering::Release);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        debug!("deallocating socket {}", self.id);
        self.close_record();
        debug_assert!(
            !self.stream_bound.load(Ordering::Acquire),
            "socket deallocated while stream adapter bound"
        );
    }
}

/// Reconcile the connection state machine from a non-blocking readiness
/// probe of the slot's descriptor. The record is resolved lazily, only in
/// the branches that touch it.
pub(crate) fn poll_state(system: &SocketSystem, slot: &Slot) -> SocketState {
    match slot.state() {
        state @ (SocketState::NotConnected
        | SocketState::Disconnected
        | SocketState::Listening) => return state,
        _ => {}
    }

    if slot.state() == SocketState::Connecting {
        let (writable, excepted) = sys::probe_connect(slot.fd());
        if excepted {
            debug!(
                "socket {:?} (fd {}): error in state connecting",
                slot.object(),
                slot.fd()
            );
            let sock = slot.object().and_then(|id| system.map.lookup(id));
            if let Some(sock) = &sock {
                sock.close_record();
            }
            return SocketState::Disconnected;
        }
        if writable {
            debug!(
                "socket {:?} (fd {}): connecting -> connected",
                slot.object(),
                slot.fd()
            );
            slot.set_state(SocketState::Connected);
        }
        return slot.state();
    }

    // Connected: a negative availability probe means hangup. Fall through
    // to the disconnected drain check instead of closing outright so a
    // consumer can still drain buffered input.
    if slot.state() == SocketState::Connected {
        if sys::available_fd(slot.fd()) >= 0 {
            return SocketState::Connected;
        }
        debug!(
            "socket {:?} (fd {}): hangup in connected",
            slot.object(),
            slot.fd()
        );
        slot.set_state(SocketState::Disconnected);
    }

    let sock = slot.object().and_then(|id| system.map.lookup(id));
    let buffered = sock.as_ref().map_or(0, |sock| sock.buffered_in());
    if buffered == 0 {
        debug!(
            "socket {:?} (fd {}): all data read in disconnected",
            slot.object(),
            slot.fd()
        );
        if let Some(sock) = &sock {
            sock.close_record();
        }
    }

    slot.state()
}

fn resolve(id: SocketId) -> Result<Arc<Socket>, Error> {
    let system = network::system().ok_or(Error::NotInitialized)?;
    system.map.lookup(id).ok_or(Error::InvalidId(id))
}

fn resolve_quiet(id: SocketId) -> Option<Arc<Socket>> {
    resolve(id).ok()
}

/// Look up a record, returning a guard that keeps it alive while held.
pub fn acquire(id: SocketId) -> Option<SocketRef> {
    resolve_quiet(id)
}

pub fn is_socket(id: SocketId) -> bool {
    resolve_quiet(id).is_some()
}

pub fn bind(id: SocketId, address: &NetworkAddress) -> bool {
    let sock = match resolve(id) {
        Ok(sock) => sock,
        Err(err) => {
            error!("trying to bind socket {}: {}", id, err);
            return false;
        }
    };

    if sock.create_fd(address.family()) == INVALID_FD {
        return false;
    }
    let Some(slot) = sock.slot() else {
        return false;
    };

    let (sa, len) = address.sockaddr();
    if unsafe { libc::bind(slot.fd(), sa, len) } == 0 {
        sock.store_address_local();
        info!(
            "bound socket {} (fd {}) to local address {}",
            id,
            slot.fd(),
            address
        );
        true
    } else {
        warn!(
            "unable to bind socket {} (fd {}) to local address {}: {}",
            id,
            slot.fd(),
            address,
            io::Error::last_os_error()
        );
        false
    }
}

pub fn connect(id: SocketId, address: &NetworkAddress, timeout_ms: u32) -> bool {
    let sock = match resolve(id) {
        Ok(sock) => sock,
        Err(err) => {
            error!("trying to connect socket {}: {}", id, err);
            return false;
        }
    };

    if sock.create_fd(address.family()) == INVALID_FD {
        return false;
    }
    let Some(slot) = sock.slot() else {
        return false;
    };

    if slot.state() != SocketState::NotConnected {
        warn!(
            "unable to connect already connected socket {} (fd {}) to remote address {}",
            id,
            slot.fd(),
            address
        );
        return false;
    }

    slot.set_flag(
        SocketFlags::CONNECTION_PENDING | SocketFlags::ERROR_PENDING | SocketFlags::HANGUP_PENDING,
        false,
    );
    slot.set_last_event(0);

    match sock.transport().connect(&sock, address, timeout_ms) {
        Ok(()) => true,
        Err(err) => {
            warn!(
                "unable to connect socket {} (fd {}) to remote address {}: {}",
                id,
                slot.fd(),
                address,
                err
            );
            false
        }
    }
}

pub fn blocking(id: SocketId) -> bool {
    resolve_quiet(id)
        .and_then(|sock| sock.slot().map(|slot| slot.has_flag(SocketFlags::BLOCKING)))
        .unwrap_or(false)
}

pub fn set_blocking(id: SocketId, block: bool) {
    match resolve(id) {
        Ok(sock) => sock.set_blocking_flag(block),
        Err(err) => error!("trying to set blocking flag on socket {}: {}", id, err),
    }
}

pub fn reuse_address(id: SocketId) -> bool {
    resolve_quiet(id)
        .and_then(|sock| {
            sock.slot()
                .map(|slot| slot.has_flag(SocketFlags::REUSE_ADDR))
        })
        .unwrap_or(false)
}

pub fn set_reuse_address(id: SocketId, reuse: bool) {
    match resolve(id) {
        Ok(sock) => sock.set_reuse_address_flag(reuse),
        Err(err) => error!("trying to set reuse address flag on socket {}: {}", id, err),
    }
}

pub fn reuse_port(id: SocketId) -> bool {
    resolve_quiet(id)
        .and_then(|sock| {
            sock.slot()
                .map(|slot| slot.has_flag(SocketFlags::REUSE_PORT))
        })
        .unwrap_or(false)
}

pub fn set_reuse_port(id: SocketId, reuse: bool) {
    match resolve(id) {
        Ok(sock) => sock.set_reuse_port_flag(reuse),
        Err(err) => error!("trying to set reuse port flag on socket {}: {}", id, err),
    }
}

/// Join an IPv4 multicast group on the socket's descriptor. TTL is fixed
/// at link-local scope.
pub fn set_multicast_group(id: SocketId, address: &NetworkAddress, allow_loopback: bool) -> bool {
    let sock = match resolve(id) {
        Ok(sock) => sock,
        Err(err) => {
            error!("trying to set multicast group on socket {}: {}", id, err);
            return false;
        }
    };

    if sock.claim_slot().is_none() {
        return false;
    }
    let Some(slot) = sock.slot() else {
        return false;
    };
    let fd = slot.fd();
    if fd == INVALID_FD {
        return false;
    }

    let NetworkAddress::Ipv4(group) = address else {
        warn!(
            "unable to set multicast group on socket {} (fd {}): not an ipv4 group address",
            id, fd
        );
        return false;
    };

    let _ = sys::set_option_byte(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, 1);
    let _ = sys::set_option_byte(
        fd,
        libc::IPPROTO_IP,
        libc::IP_MULTICAST_LOOP,
        allow_loopback as u8,
    );

    let req = libc::ip_mreq {
        imr_multiaddr: group.sin_addr,
        imr_interface: libc::in_addr {
            s_addr: libc::INADDR_ANY,
        },
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_ADD_MEMBERSHIP,
            &req as *const _ as *const libc::c_void,
            mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        error!(
            "add multicast group failed on socket {} (fd {}): {}",
            id,
            fd,
            io::Error::last_os_error()
        );
        return false;
    }
    true
}

pub fn address_local(id: SocketId) -> Option<NetworkAddress> {
    resolve_quiet(id).and_then(|sock| sock.address_local())
}

pub fn address_remote(id: SocketId) -> Option<NetworkAddress> {
    resolve_quiet(id).and_then(|sock| sock.address_remote())
}

pub fn state(id: SocketId) -> SocketState {
    let Some(sock) = resolve_quiet(id) else {
        return SocketState::NotConnected;
    };
    match sock.slot() {
        Some(slot) => poll_state(sock.system(), slot),
        None => SocketState::NotConnected,
    }
}

pub fn close(id: SocketId) {
    if let Some(sock) = resolve_quiet(id) {
        sock.close_record();
    }
}

/// Decouple the id from its record. The record is destroyed when the last
/// outstanding guard drops; with no guards held this is immediate.
pub fn free(id: SocketId) -> bool {
    let Some(system) = network::system() else {
        return false;
    };
    system.map.free(id).is_some()
}

/// Wrap the socket in a stream adapter. At most one adapter may exist per
/// record; while one is bound this returns None.
pub fn stream(id: SocketId) -> Option<SocketStream> {
    let sock = resolve_quiet(id)?;
    if !sock.bind_stream() {
        return None;
    }
    let mut stream = SocketStream::bind(Arc::clone(&sock));
    sock.transport().stream_initialize(&sock, &mut stream);
    Some(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing;
    use crate::tcp;

    #[test]
    fn create_and_free() {
        testing::ensure_initialized();
        let sock = tcp::create().unwrap();
        assert!(is_socket(sock));
        assert!(free(sock));
        assert!(!is_socket(sock));
    }

    #[test]
    fn blocking_toggle() {
        testing::ensure_initialized();
        let sock = tcp::create().unwrap();
        assert!(is_socket(sock));

        set_blocking(sock, false);
        assert!(!blocking(sock));

        set_blocking(sock, true);
        assert!(blocking(sock));

        assert!(free(sock));
        assert!(!is_socket(sock));
    }

    #[test]
    fn bind_ipv4_port_scan() {
        testing::ensure_initialized();
        let sock = tcp::create().unwrap();
        assert!(is_socket(sock));

        assert_eq!(address_local(sock), None);
        assert_eq!(address_remote(sock), None);
        assert_eq!(state(sock), SocketState::NotConnected);

        let mut bound = None;
        for port in 31890..32890 {
            let mut address = NetworkAddress::ipv4_any();
            address.set_port(port);
            if bind(sock, &address) {
                bound = Some(address);
                break;
            }
        }
        let bound = bound.expect("no bindable port in scan range");

        assert_eq!(address_local(sock), Some(bound));
        assert_eq!(address_remote(sock), None);
        assert_eq!(state(sock), SocketState::NotConnected);

        assert!(free(sock));
        assert!(!is_socket(sock));
    }

    #[test]
    fn bind_ipv6_port_scan() {
        testing::ensure_initialized();
        if !network::supports_ipv6() {
            return;
        }
        let sock = tcp::create().unwrap();

        let mut bound = None;
        for port in 31890..32890 {
            let mut address = NetworkAddress::ipv6_any();
            address.set_port(port);
            if bind(sock, &address) {
                bound = Some(address);
                break;
            }
        }
        let bound = bound.expect("no bindable port in scan range");

        assert_eq!(address_local(sock), Some(bound));
        assert_eq!(state(sock), SocketState::NotConnected);

        assert!(free(sock));
    }

    #[test]
    fn close_is_idempotent() {
        testing::ensure_initialized();
        let sock = tcp::create().unwrap();
        let mut address = NetworkAddress::ipv4_loopback();
        address.set_port(0);
        assert!(bind(sock, &address));

        close(sock);
        assert!(is_socket(sock));
        assert_eq!(state(sock), SocketState::NotConnected);
        assert_eq!(address_local(sock), None);

        close(sock);
        assert!(is_socket(sock));
        assert_eq!(state(sock), SocketState::NotConnected);

        assert!(free(sock));
        assert!(!is_socket(sock));
    }

    #[test]
    fn guard_outlives_free() {
        testing::ensure_initialized();
        let sock = tcp::create().unwrap();
        let guard = acquire(sock).unwrap();

        assert!(free(sock));
        assert!(!is_socket(sock));
        assert!(acquire(sock).is_none());

        // The record is still alive through the guard.
        assert_eq!(guard.id(), sock);
    }
}
