//! Transport hook set.

use crate::address::{AddressFamily, NetworkAddress};
use crate::errors::Result;
use crate::socket::Socket;
use crate::stream::SocketStream;

/// The family-specific operations a socket record dispatches through.
/// TCP is the implemented variant; datagram and pipe transports plug in
/// here.
pub trait Transport: Sync {
    /// Create the kernel descriptor for `family` and install it in the
    /// record's slot. Leaves the slot's fd INVALID on failure.
    fn open(&self, sock: &Socket, family: AddressFamily);

    /// Family-specific connect with the module's completion policy
    /// (immediate, deferred via the state poller, or probed with a
    /// timeout).
    fn connect(&self, sock: &Socket, address: &NetworkAddress, timeout_ms: u32) -> Result<()>;

    /// Pull kernel-buffered bytes into the in-ring, up to `wanted` when
    /// non-zero. Returns the number of bytes newly buffered.
    fn buffer_read(&self, sock: &Socket, wanted: usize) -> usize;

    /// Drain the out-buffer to the kernel, compacting on partial send.
    fn buffer_write(&self, sock: &Socket);

    /// Hook invoked when a stream adapter is bound to the record.
    fn stream_initialize(&self, _sock: &Socket, _stream: &mut SocketStream) {}
}
