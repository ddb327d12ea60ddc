// Trait seams: the byte-stream interface socket adapters implement, and
// the transport hook set records dispatch through.

pub mod stream;
pub mod transport;

pub use stream::{ByteOrder, SeekMode, Stream};
pub use transport::Transport;

pub use crate::errors::Result;
