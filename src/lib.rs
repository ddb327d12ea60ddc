//! # netstream
//!
//! A TCP/IP socket object system layered on a generic byte-stream
//! interface: sockets are reached through opaque ids resolved in a
//! thread-safe handle registry, descriptor-level state lives in a small
//! lock-free slot table that external pollers can scan, per-socket I/O is
//! ring buffered, and a stream adapter makes any socket usable where a
//! sequential binary stream is expected (including `std::io::Read` and
//! `std::io::Write`).
//!
//! ## Quick start
//!
//! ```ignore
//! use netstream::api::Stream;
//! use netstream::{network, socket, tcp, NetworkAddress};
//!
//! network::initialize(network::NetworkConfig::default())?;
//!
//! let listener = tcp::create().unwrap();
//! socket::bind(listener, &NetworkAddress::ipv4_loopback());
//! tcp::listen(listener);
//!
//! let client = tcp::create().unwrap();
//! socket::connect(client, &socket::address_local(listener).unwrap(), 1000);
//! let peer = tcp::accept(listener, 1000).unwrap();
//!
//! let mut stream = socket::stream(client).unwrap();
//! stream.write(b"Hello World");
//! stream.flush();
//! ```

pub mod address;
pub mod api;
pub mod errors;
pub mod event;
pub mod handle;
pub mod network;
pub mod slot;
pub mod socket;
pub mod stream;
pub mod tcp;

pub(crate) mod serial_cell;
pub(crate) mod sys;

pub use address::{AddressFamily, NetworkAddress};
pub use event::{EventKind, NetworkEvent};
pub use handle::SocketId;
pub use slot::{SocketFlags, SocketState};
pub use stream::SocketStream;
