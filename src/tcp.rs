//! TCP/IP transport: stream-socket hooks for the record layer plus the
//! listener-side operations.

use std::io;
use std::mem;

use tracing::{debug, error, info, warn};

use crate::address::{AddressFamily, NetworkAddress};
use crate::api::Transport;
use crate::errors::{classify, Error, ErrorClass, Result};
use crate::event::{self, EventKind};
use crate::handle::SocketId;
use crate::slot::{SocketFlags, SocketState};
use crate::socket::{self, poll_state, Socket, READ_BUFFER_SIZE};
use crate::sys::{self, INVALID_FD};

pub struct Tcp;

static TCP: Tcp = Tcp;

/// Allocate a TCP socket record and return its id.
pub fn create() -> Option<SocketId> {
    let system = crate::network::system()?;
    let id = system.map.reserve()?;
    let sock = std::sync::Arc::new(Socket::new(id, std::sync::Arc::clone(&system), &TCP));
    debug!("allocated tcp socket {}", id);
    system.map.set(id, sock);
    Some(id)
}

/// Start listening. The socket must be freshly bound: not connected, with
/// a live descriptor and a local address.
pub fn listen(id: SocketId) -> bool {
    let Some(sock) = socket::acquire(id) else {
        return false;
    };
    let Some(slot) = sock.slot() else {
        return false;
    };
    if slot.state() != SocketState::NotConnected
        || slot.fd() == INVALID_FD
        || sock.address_local().is_none()
    {
        warn!(
            "unable to listen on socket {} (fd {}): {}",
            id,
            slot.fd(),
            Error::InvalidState
        );
        return false;
    }

    if unsafe { libc::listen(slot.fd(), libc::SOMAXCONN) } == 0 {
        info!(
            "listening on tcp socket {} (fd {}) local address {:?}",
            id,
            slot.fd(),
            sock.address_local()
        );
        slot.set_state(SocketState::Listening);
        true
    } else {
        error!(
            "unable to listen on tcp socket {} (fd {}): {}",
            id,
            slot.fd(),
            io::Error::last_os_error()
        );
        false
    }
}

/// Accept a pending connection, waiting up to `timeout_ms`. Returns the
/// id of a new record in connected state, or None.
pub fn accept(id: SocketId, timeout_ms: u32) -> Option<SocketId> {
    let sock = socket::acquire(id)?;
    let slot = sock.slot()?;
    if slot.state() != SocketState::Listening
        || slot.fd() == INVALID_FD
        || sock.address_local().is_none()
    {
        return None;
    }

    let blocking = slot.has_flag(SocketFlags::BLOCKING);
    if timeout_ms > 0 && blocking {
        sock.set_blocking_flag(false);
    }

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let mut fd = unsafe {
        libc::accept(
            slot.fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if fd < 0 && timeout_ms > 0 && classify(sys::last_errno()) == ErrorClass::WouldBlock {
        if let Ok(true) = sys::wait_fd(slot.fd(), false, timeout_ms) {
            len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            fd = unsafe {
                libc::accept(
                    slot.fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
        }
    }

    if timeout_ms > 0 && blocking {
        sock.set_blocking_flag(true);
    }

    slot.set_flag(SocketFlags::CONNECTION_PENDING, false);

    if fd < 0 {
        return None;
    }

    let Some(accepted_id) = create() else {
        sys::close_fd(fd);
        return None;
    };
    let accepted = socket::acquire(accepted_id)?;
    if accepted.claim_slot().is_none() {
        socket::free(accepted_id);
        sys::close_fd(fd);
        return None;
    }

    let accepted_slot = accepted.slot()?;
    accepted_slot.set_fd(fd);
    accepted_slot.set_state(SocketState::Connected);

    let remote = NetworkAddress::from_raw(&storage, len);
    let family = remote.map_or(AddressFamily::Ipv4, |address| address.family());
    accepted.set_family(family);
    accepted.set_address_remote(remote);
    accepted.store_address_local();

    info!(
        "accepted connection on tcp socket {} (fd {}): created socket {} (fd {}) remote address {:?}",
        id,
        slot.fd(),
        accepted_id,
        fd,
        accepted.address_remote()
    );

    Some(accepted_id)
}

/// Whether Nagle's algorithm is enabled on the socket.
pub fn delay(id: SocketId) -> bool {
    socket::acquire(id)
        .and_then(|sock| sock.slot().map(|slot| slot.has_flag(SocketFlags::TCP_DELAY)))
        .unwrap_or(false)
}

pub fn set_delay(id: SocketId, delay: bool) {
    let Some(sock) = socket::acquire(id) else {
        error!(
            "trying to set delay flag on socket {}: {}",
            id,
            Error::InvalidId(id)
        );
        return;
    };
    set_delay_flag(&sock, delay);
}

fn set_delay_flag(sock: &Socket, delay: bool) {
    let Some(slot) = sock.slot() else {
        return;
    };
    slot.set_flag(SocketFlags::TCP_DELAY, delay);
    if slot.fd() != INVALID_FD {
        let _ = sys::set_option(
            slot.fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            (!delay) as libc::c_int,
        );
    }
}

fn post_hangup(sock: &Socket) {
    event::post(EventKind::Hangup, sock.id());
}

impl Transport for Tcp {
    fn open(&self, sock: &Socket, family: AddressFamily) {
        let Some(slot) = sock.slot() else {
            return;
        };
        let fd = unsafe { libc::socket(family.raw(), libc::SOCK_STREAM, libc::IPPROTO_TCP) };
        if fd < 0 {
            error!(
                "unable to open tcp socket {}: {}",
                sock.id(),
                io::Error::last_os_error()
            );
            slot.set_fd(INVALID_FD);
            return;
        }

        slot.set_fd(fd);
        debug!("opened tcp socket {} (fd {})", sock.id(), fd);

        let flags = slot.flags();
        sock.set_blocking_flag(flags.contains(SocketFlags::BLOCKING));
        set_delay_flag(sock, flags.contains(SocketFlags::TCP_DELAY));
    }

    fn connect(&self, sock: &Socket, address: &NetworkAddress, timeout_ms: u32) -> Result<()> {
        let Some(slot) = sock.slot() else {
            return Ok(());
        };

        let blocking = slot.has_flag(SocketFlags::BLOCKING);
        if timeout_ms > 0 && blocking {
            sock.set_blocking_flag(false);
        }

        let (sa, len) = address.sockaddr();
        let ret = unsafe { libc::connect(slot.fd(), sa, len) };

        let mut result = Ok(());
        if ret == 0 {
            slot.set_state(SocketState::Connected);
        } else {
            let errno = sys::last_errno();
            if classify(errno) == ErrorClass::WouldBlock {
                if timeout_ms == 0 {
                    // Deferred completion: the state poller finishes the
                    // handshake.
                    slot.set_state(SocketState::Connecting);
                } else {
                    match sys::wait_fd(slot.fd(), true, timeout_ms) {
                        Ok(true) => {
                            let serr = sys::take_socket_error(slot.fd());
                            if serr == 0 {
                                slot.set_state(SocketState::Connected);
                            } else {
                                result = Err(Error::from_errno(serr));
                            }
                        }
                        Ok(false) => result = Err(Error::Timeout),
                        Err(err) => result = Err(Error::SystemCall(err)),
                    }
                }
            } else {
                result = Err(Error::from_errno(errno));
            }
        }

        if timeout_ms > 0 && blocking {
            sock.set_blocking_flag(true);
        }

        result?;

        sock.set_address_remote(Some(*address));
        if sock.address_local().is_none() {
            sock.store_address_local();
        }

        debug!(
            "{} socket {} (fd {}) to remote host {}",
            if slot.state() == SocketState::Connecting {
                "connecting"
            } else {
                "connected"
            },
            sock.id(),
            slot.fd(),
            address
        );
        Ok(())
    }

    fn buffer_read(&self, sock: &Socket, wanted: usize) -> usize {
        let Some(slot) = sock.slot() else {
            return 0;
        };

        let read = sock.offset_read_in();
        let write = sock.offset_write_in();
        let max_read = if write >= read {
            let mut region = READ_BUFFER_SIZE - write;
            if read == 0 {
                // One byte is sacrificed so a write cursor wrapping onto
                // the read cursor cannot be mistaken for an empty ring.
                region -= 1;
            }
            region
        } else {
            read - write - 1
        };
        if max_read == 0 {
            return 0;
        }

        let mut try_read = max_read;
        if wanted != 0 && try_read > wanted {
            try_read = wanted;
        }

        let available = sys::available_fd(slot.fd());
        if available == 0 && wanted == 0 && slot.has_flag(SocketFlags::BLOCKING) {
            return 0;
        }
        let kernel_pending = if available < 0 {
            usize::MAX
        } else {
            available as usize
        };
        if kernel_pending > try_read {
            try_read = max_read.min(kernel_pending);
        }

        let ret = {
            // SAFETY: reads on a socket are serialized by the caller; the
            // in-ring is only touched by that reader.
            let mut guard = unsafe { sock.buffer_in.borrow_mut() };
            unsafe {
                libc::recv(
                    slot.fd(),
                    guard.as_mut_ptr().add(write) as *mut libc::c_void,
                    try_read,
                    0,
                )
            }
        };

        if ret == 0 {
            debug!(
                "socket {} (fd {}) closed gracefully on remote end",
                sock.id(),
                slot.fd()
            );
            sock.close_record();
            if !slot.has_flag(SocketFlags::HANGUP_PENDING) {
                slot.set_flag(SocketFlags::HANGUP_PENDING, true);
                post_hangup(sock);
            }
            0
        } else if ret > 0 {
            let got = ret as usize;
            let mut new_write = write + got;
            debug_assert!(new_write <= READ_BUFFER_SIZE, "read buffer overwrite");
            if new_write >= READ_BUFFER_SIZE {
                new_write = 0;
            }
            sock.set_offset_write_in(new_write);

            // The segment was cut short by the ring's end; continue once
            // into the wrapped-around region if the caller still wants
            // more and the kernel has it.
            let mut total = got;
            if slot.state() == SocketState::Connected
                && try_read < wanted
                && kernel_pending > try_read
                && new_write == 0
                && sock.offset_read_in() > 1
            {
                total += self.buffer_read(sock, wanted - try_read);
            }
            total
        } else {
            let errno = sys::last_errno();
            let class = classify(errno);
            if class != ErrorClass::WouldBlock {
                warn!(
                    "socket recv() failed on {} (fd {}): {} ({})",
                    sock.id(),
                    slot.fd(),
                    io::Error::from_raw_os_error(errno),
                    errno
                );
            }
            if class == ErrorClass::Terminated {
                sock.close_record();
                if !slot.has_flag(SocketFlags::HANGUP_PENDING) {
                    slot.set_flag(SocketFlags::HANGUP_PENDING, true);
                    post_hangup(sock);
                }
            }
            poll_state(sock.system(), slot);
            0
        }
    }

    fn buffer_write(&self, sock: &Socket) {
        let Some(slot) = sock.slot() else {
            return;
        };
        let pending = sock.offset_write_out();
        let mut sent = 0usize;

        while sent < pending {
            let ret = {
                // SAFETY: writes on a socket are serialized by the caller.
                let guard = unsafe { sock.buffer_out.borrow_mut() };
                unsafe {
                    libc::send(
                        slot.fd(),
                        guard.as_ptr().add(sent) as *const libc::c_void,
                        pending - sent,
                        libc::MSG_NOSIGNAL,
                    )
                }
            };

            if ret > 0 {
                sent += ret as usize;
                continue;
            }

            if ret < 0 {
                let errno = sys::last_errno();
                let serr = sys::take_socket_error(slot.fd());
                let class = classify(errno);
                if class == ErrorClass::WouldBlock {
                    warn!(
                        "partial tcp send() on socket {} (fd {}): {} of {} bytes written (SO_ERROR {})",
                        sock.id(),
                        slot.fd(),
                        sent,
                        pending,
                        serr
                    );
                    slot.set_flag(SocketFlags::REFLUSH, true);
                } else {
                    warn!(
                        "socket send() failed on {} (fd {}): {} ({}) (SO_ERROR {})",
                        sock.id(),
                        slot.fd(),
                        io::Error::from_raw_os_error(errno),
                        errno,
                        serr
                    );
                }
                if class == ErrorClass::Terminated {
                    sock.close_record();
                    if !slot.has_flag(SocketFlags::HANGUP_PENDING) {
                        slot.set_flag(SocketFlags::HANGUP_PENDING, true);
                        post_hangup(sock);
                    }
                }
                if slot.state() != SocketState::NotConnected {
                    poll_state(sock.system(), slot);
                }
            }

            // Compact the unsent tail to the buffer origin and let the
            // caller retry on writability.
            if sent > 0 {
                let mut guard = unsafe { sock.buffer_out.borrow_mut() };
                guard.copy_within(sent..pending, 0);
            }
            sock.set_offset_write_out(pending - sent);
            return;
        }

        slot.set_flag(SocketFlags::REFLUSH, false);
        sock.set_offset_write_out(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Stream;
    use crate::network::testing;
    use crate::socket;
    use std::time::{Duration, Instant};

    fn loopback_listener() -> (SocketId, NetworkAddress) {
        let sock = create().unwrap();
        let address = NetworkAddress::ipv4_loopback();
        assert!(socket::bind(sock, &address));
        assert!(listen(sock));
        let local = socket::address_local(sock).unwrap();
        assert_ne!(local.port(), 0);
        (sock, local)
    }

    #[test]
    fn accept_and_round_trip() {
        testing::ensure_initialized();
        let (server, server_address) = loopback_listener();

        let client = create().unwrap();
        assert!(socket::connect(client, &server_address, 1000));
        assert_eq!(socket::address_remote(client), Some(server_address));

        let accepted = accept(server, 1000).expect("pending connection");
        assert_eq!(socket::state(accepted), SocketState::Connected);
        assert!(socket::address_remote(accepted).is_some());
        assert!(socket::address_local(accepted).is_some());

        let mut client_stream = socket::stream(client).unwrap();
        let mut server_stream = socket::stream(accepted).unwrap();

        let payload = b"Hello World";
        assert_eq!(client_stream.write(payload), payload.len());
        Stream::flush(&mut client_stream);

        socket::set_blocking(accepted, true);
        let mut incoming = [0u8; 11];
        assert_eq!(server_stream.read(&mut incoming), payload.len());
        assert_eq!(&incoming, payload);

        drop(client_stream);
        drop(server_stream);
        assert!(socket::free(client));
        assert!(socket::free(accepted));
        assert!(socket::free(server));
    }

    #[test]
    fn accept_empty_listener_times_out() {
        testing::ensure_initialized();
        let (server, _) = loopback_listener();

        assert!(accept(server, 0).is_none());

        let started = Instant::now();
        assert!(accept(server, 50).is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));

        assert_eq!(socket::state(server), SocketState::Listening);
        assert!(socket::free(server));
    }

    #[test]
    fn accept_preserves_listener_flags() {
        testing::ensure_initialized();
        let (server, _) = loopback_listener();

        socket::set_blocking(server, true);
        assert!(accept(server, 50).is_none());
        assert!(socket::blocking(server));
        assert_eq!(socket::state(server), SocketState::Listening);

        assert!(socket::free(server));
    }

    #[test]
    fn deferred_connect_completes_through_poller() {
        testing::ensure_initialized();
        let (server, server_address) = loopback_listener();

        let client = create().unwrap();
        assert!(socket::connect(client, &server_address, 0));
        let state = socket::state(client);
        assert!(
            state == SocketState::Connecting || state == SocketState::Connected,
            "unexpected state {state:?}"
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while socket::state(client) != SocketState::Connected {
            assert!(Instant::now() < deadline, "connect never completed");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(socket::free(client));
        assert!(socket::free(server));
    }

    #[test]
    fn delay_flag_tracks_descriptor() {
        testing::ensure_initialized();
        let sock = create().unwrap();
        let address = NetworkAddress::ipv4_loopback();
        assert!(socket::bind(sock, &address));

        assert!(!delay(sock));
        set_delay(sock, true);
        assert!(delay(sock));
        set_delay(sock, false);
        assert!(!delay(sock));

        assert!(socket::free(sock));
    }

    #[test]
    fn listen_requires_bound_socket() {
        testing::ensure_initialized();
        let sock = create().unwrap();
        // No descriptor and no local address yet.
        assert!(!listen(sock));
        assert!(socket::free(sock));
    }
}
