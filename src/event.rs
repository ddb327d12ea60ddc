//! Process-wide network event stream. Transports post lifecycle events
//! here; subscribers drain the stream and filter on the kind they care
//! about.

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;

use crate::handle::SocketId;

/// Event kinds. `Connected` and `Error` are reserved for transports that
/// complete handshakes asynchronously; the TCP transport currently posts
/// `Hangup` only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Hangup,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkEvent {
    pub kind: EventKind,
    pub socket: SocketId,
}

static CHANNEL: Lazy<(Sender<NetworkEvent>, Receiver<NetworkEvent>)> = Lazy::new(unbounded);

pub fn post(kind: EventKind, socket: SocketId) {
    let _ = CHANNEL.0.send(NetworkEvent { kind, socket });
}

/// Drain every pending event.
pub fn poll() -> Vec<NetworkEvent> {
    CHANNEL.1.try_iter().collect()
}
