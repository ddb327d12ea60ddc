//! Stream adapter: presents a socket as a sequential binary byte stream.
//!
//! The adapter owns the single record reference transferred to it at
//! construction and clears the record's back-pointer when dropped, so at
//! most one adapter exists per socket at any time.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, warn};

use crate::api::{SeekMode, Stream};
use crate::handle::SocketId;
use crate::slot::{SocketFlags, SocketState};
use crate::socket::{poll_state, Socket, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE};
use crate::sys::{self, INVALID_FD};

pub struct SocketStream {
    socket: Arc<Socket>,
}

impl SocketStream {
    pub(crate) fn bind(socket: Arc<Socket>) -> SocketStream {
        SocketStream { socket }
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket.id()
    }

    /// Shared read path: drain the in-ring into `dest` (or discard when
    /// `dest` is None), topping the ring up through the transport while
    /// progress is being made. Bounded at two consecutive idle rounds.
    fn read_internal(&mut self, mut dest: Option<&mut [u8]>, size: usize) -> usize {
        let sock = &self.socket;
        let Some(slot) = sock.slot() else {
            return 0;
        };

        let polled = slot.has_flag(SocketFlags::POLLED);
        let blocking = slot.has_flag(SocketFlags::BLOCKING);

        // Re-arm read events: a poll after this drain must re-emit the
        // data-available edge even if the buffered amount is unchanged.
        slot.set_last_event(0);

        let state = slot.state();
        if state != SocketState::Connected && state != SocketState::Disconnected {
            return 0;
        }
        if size == 0 {
            return 0;
        }

        let mut was_read = 0usize;
        let mut idle_rounds = 0;

        loop {
            let mut try_again = false;

            loop {
                let read = sock.offset_read_in();
                let write = sock.offset_write_in();
                let contiguous = if write >= read {
                    write - read
                } else {
                    READ_BUFFER_SIZE - read
                };
                let copy = contiguous.min(size - was_read);
                if copy == 0 {
                    break;
                }

                {
                    // SAFETY: reads on a socket are serialized by the
                    // caller; this is the only reader of the in-ring.
                    let guard = unsafe { sock.buffer_in.borrow_mut() };
                    if let Some(out) = dest.as_deref_mut() {
                        out[was_read..was_read + copy]
                            .copy_from_slice(&guard[read..read + copy]);
                    }
                }

                was_read += copy;
                let mut new_read = read + copy;
                if new_read == READ_BUFFER_SIZE {
                    new_read = 0;
                }
                sock.set_offset_read_in(new_read);
                try_again = true;
            }

            if was_read < size && (blocking || !polled) {
                try_again |= sock.transport().buffer_read(sock, size - was_read) > 0;
            }

            if was_read >= size {
                break;
            }
            if !try_again {
                idle_rounds += 1;
                if idle_rounds >= 2 {
                    break;
                }
            }
        }

        if was_read < size {
            if was_read > 0 {
                warn!(
                    "socket {} (fd {}): partial read {} of {} bytes",
                    sock.id(),
                    slot.fd(),
                    was_read,
                    size
                );
            }
            poll_state(sock.system(), slot);
        }

        sock.add_bytes_read(was_read as u64);
        was_read
    }
}

impl Stream for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let size = buf.len();
        self.read_internal(Some(buf), size)
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let sock = &self.socket;
        let Some(slot) = sock.slot() else {
            return 0;
        };
        if slot.state() != SocketState::Connected {
            return 0;
        }
        if buf.is_empty() {
            return 0;
        }

        let size = buf.len();
        let mut was_written = 0usize;

        loop {
            let fill = sock.offset_write_out();
            let remain = WRITE_BUFFER_SIZE - fill;
            let left = size - was_written;

            if left <= remain {
                {
                    // SAFETY: writes on a socket are serialized by the
                    // caller; this is the only writer of the out-buffer.
                    let mut guard = unsafe { sock.buffer_out.borrow_mut() };
                    guard[fill..fill + left].copy_from_slice(&buf[was_written..]);
                }
                sock.set_offset_write_out(fill + left);
                was_written = size;
                break;
            }

            if remain > 0 {
                {
                    let mut guard = unsafe { sock.buffer_out.borrow_mut() };
                    guard[fill..].copy_from_slice(&buf[was_written..was_written + remain]);
                }
                sock.set_offset_write_out(WRITE_BUFFER_SIZE);
                was_written += remain;
            }

            sock.do_flush();

            if slot.state() != SocketState::Connected {
                warn!(
                    "socket {} (fd {}): partial write {} of {} bytes",
                    sock.id(),
                    slot.fd(),
                    was_written,
                    size
                );
                break;
            }
            if sock.offset_write_out() == WRITE_BUFFER_SIZE {
                // The flush made no room; leave the tail for a
                // writability retry.
                break;
            }
        }

        sock.add_bytes_written(was_written as u64);
        was_written
    }

    fn eos(&mut self) -> bool {
        let sock = &self.socket;
        let Some(slot) = sock.slot() else {
            return true;
        };
        let state = poll_state(sock.system(), slot);
        (state != SocketState::Connected || slot.fd() == INVALID_FD)
            && sock.available_nonblock_read() == 0
    }

    fn available_read(&mut self) -> usize {
        if self.socket.slot().is_none() {
            return 0;
        }
        self.socket.available_nonblock_read()
    }

    fn buffer_read(&mut self) {
        let sock = &self.socket;
        let Some(slot) = sock.slot() else {
            return;
        };
        if slot.state() != SocketState::Connected
            || slot.has_flag(SocketFlags::POLLED)
            || slot.fd() == INVALID_FD
        {
            return;
        }
        if sock.buffered_in() + 1 >= READ_BUFFER_SIZE {
            return;
        }
        let available = sys::available_fd(slot.fd());
        if available > 0 {
            sock.transport().buffer_read(sock, available as usize);
        }
    }

    fn flush(&mut self) {
        self.socket.do_flush();
    }

    fn seek(&mut self, offset: i64, mode: SeekMode) {
        if mode != SeekMode::Current || offset < 0 {
            error!("invalid seek on socket stream, only forward seeking allowed");
            return;
        }
        self.read_internal(None, offset as usize);
    }

    fn tell(&self) -> i64 {
        self.socket.bytes_read() as i64
    }

    fn last_modified(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl io::Read for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(Stream::read(self, buf))
    }
}

impl io::Write for SocketStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Stream::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Stream::flush(self);
        Ok(())
    }
}

impl Drop for SocketStream {
    fn drop(&mut self) {
        self.socket.release_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkAddress;
    use crate::event::{self, EventKind};
    use crate::handle::SocketId;
    use crate::network::testing;
    use crate::{socket, tcp};
    use std::time::{Duration, Instant};

    fn connected_pair() -> (SocketId, SocketId, SocketId) {
        let server = tcp::create().unwrap();
        let address = NetworkAddress::ipv4_loopback();
        assert!(socket::bind(server, &address));
        assert!(tcp::listen(server));
        let local = socket::address_local(server).unwrap();

        let client = tcp::create().unwrap();
        assert!(socket::connect(client, &local, 1000));
        let accepted = tcp::accept(server, 1000).expect("pending connection");
        (client, accepted, server)
    }

    fn release(ids: &[SocketId]) {
        for &id in ids {
            assert!(socket::free(id));
        }
    }

    fn pattern(i: usize) -> u8 {
        (i % 251) as u8
    }

    fn read_exactly(stream: &mut SocketStream, out: &mut [u8]) {
        let mut total = 0;
        while total < out.len() {
            let read = stream.read(&mut out[total..]);
            assert!(read > 0, "read stalled at {total} of {} bytes", out.len());
            total += read;
        }
    }

    #[test]
    fn hangup_on_peer_close() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        socket::set_blocking(client, true);
        let mut stream = socket::stream(client).unwrap();

        socket::close(accepted);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf), 0);

        let hangup = event::poll()
            .into_iter()
            .any(|event| event.kind == EventKind::Hangup && event.socket == client);
        assert!(hangup, "no hangup event for the client socket");
        assert!(stream.eos());

        drop(stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn eos_tracks_drain_and_peer_close() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        socket::set_blocking(accepted, true);
        let mut client_stream = socket::stream(client).unwrap();
        let mut server_stream = socket::stream(accepted).unwrap();
        assert!(!server_stream.eos());

        assert_eq!(client_stream.write(b"x"), 1);
        Stream::flush(&mut client_stream);
        socket::close(client);

        let mut buf = [0u8; 1];
        read_exactly(&mut server_stream, &mut buf);
        assert_eq!(buf[0], b'x');

        // The tail is drained; the next read observes the hangup.
        assert_eq!(server_stream.read(&mut buf), 0);
        assert!(server_stream.eos());

        drop(client_stream);
        drop(server_stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn available_read_is_monotonic_without_drain() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        let mut client_stream = socket::stream(client).unwrap();
        let mut server_stream = socket::stream(accepted).unwrap();

        assert_eq!(client_stream.write(b"hello"), 5);
        Stream::flush(&mut client_stream);
        assert_eq!(client_stream.write(b"abc"), 3);
        Stream::flush(&mut client_stream);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = 0;
        while seen < 8 {
            assert!(Instant::now() < deadline, "payload never became available");
            let now = server_stream.available_read();
            assert!(now >= seen, "available_read went backwards: {now} < {seen}");
            seen = now;
            std::thread::sleep(Duration::from_millis(2));
        }

        socket::set_blocking(accepted, true);
        let mut buf = [0u8; 8];
        read_exactly(&mut server_stream, &mut buf);
        assert_eq!(&buf, b"helloabc");

        drop(client_stream);
        drop(server_stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn seek_discards_forward_and_tell_counts() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        let mut client_stream = socket::stream(client).unwrap();
        assert_eq!(client_stream.write(b"abcdef"), 6);
        Stream::flush(&mut client_stream);

        socket::set_blocking(accepted, true);
        let mut server_stream = socket::stream(accepted).unwrap();

        let mut two = [0u8; 2];
        read_exactly(&mut server_stream, &mut two);
        assert_eq!(&two, b"ab");
        assert_eq!(server_stream.tell(), 2);

        server_stream.seek(2, SeekMode::Current);
        assert_eq!(server_stream.tell(), 4);

        read_exactly(&mut server_stream, &mut two);
        assert_eq!(&two, b"ef");
        assert_eq!(server_stream.tell(), 6);

        // Every other seek shape is rejected and changes nothing.
        server_stream.seek(-1, SeekMode::Current);
        server_stream.seek(0, SeekMode::Begin);
        server_stream.seek(0, SeekMode::End);
        assert_eq!(server_stream.tell(), 6);
        assert_eq!(server_stream.size(), 0);

        drop(client_stream);
        drop(server_stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn oversized_write_flushes_mid_call() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        socket::set_blocking(client, true);
        socket::set_blocking(accepted, true);
        let mut client_stream = socket::stream(client).unwrap();
        let mut server_stream = socket::stream(accepted).unwrap();

        let payload: Vec<u8> = (0..WRITE_BUFFER_SIZE * 2 + 4096).map(pattern).collect();
        assert_eq!(client_stream.write(&payload), payload.len());
        Stream::flush(&mut client_stream);

        let mut incoming = vec![0u8; payload.len()];
        read_exactly(&mut server_stream, &mut incoming);
        assert_eq!(incoming, payload);

        drop(client_stream);
        drop(server_stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn full_ring_read_crosses_wrap_boundary() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        socket::set_blocking(client, true);
        socket::set_blocking(accepted, true);
        let mut client_stream = socket::stream(client).unwrap();
        let mut server_stream = socket::stream(accepted).unwrap();

        // Walk the ring cursors past the midpoint so the next full-ring
        // read has to wrap.
        let first: Vec<u8> = (0..READ_BUFFER_SIZE / 2 + 1000).map(pattern).collect();
        assert_eq!(client_stream.write(&first), first.len());
        Stream::flush(&mut client_stream);
        let mut scratch = vec![0u8; first.len()];
        read_exactly(&mut server_stream, &mut scratch);
        assert_eq!(scratch, first);

        let second: Vec<u8> = (0..READ_BUFFER_SIZE - 1).map(|i| pattern(i + 7)).collect();
        assert_eq!(client_stream.write(&second), second.len());
        Stream::flush(&mut client_stream);
        let mut incoming = vec![0u8; second.len()];
        read_exactly(&mut server_stream, &mut incoming);
        assert_eq!(incoming, second);

        drop(client_stream);
        drop(server_stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn io_after_close_returns_zero() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        let mut stream = socket::stream(client).unwrap();
        socket::close(client);

        assert_eq!(stream.write(b"data"), 0);
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf), 0);
        assert_eq!(stream.available_read(), 0);
        assert!(socket::is_socket(client));

        drop(stream);
        release(&[client, accepted, server]);
    }

    #[test]
    fn at_most_one_adapter_per_socket() {
        testing::ensure_initialized();
        let sock = tcp::create().unwrap();

        let stream = socket::stream(sock).unwrap();
        assert!(socket::stream(sock).is_none());
        drop(stream);

        let rebound = socket::stream(sock).expect("adapter slot freed on drop");
        drop(rebound);

        assert!(socket::free(sock));
    }

    #[test]
    fn io_trait_bridge() {
        testing::ensure_initialized();
        let (client, accepted, server) = connected_pair();

        socket::set_blocking(accepted, true);
        let mut client_stream = socket::stream(client).unwrap();
        let mut server_stream = socket::stream(accepted).unwrap();

        io::Write::write_all(&mut client_stream, b"ping").unwrap();
        io::Write::flush(&mut client_stream).unwrap();

        let mut buf = [0u8; 4];
        io::Read::read_exact(&mut server_stream, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        drop(client_stream);
        drop(server_stream);
        release(&[client, accepted, server]);
    }
}
