use std::io;

use thiserror::Error;

use crate::address::AddressFamily;
use crate::handle::SocketId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid socket id {0}")]
    InvalidId(SocketId),
    #[error("operation not valid in current socket state")]
    InvalidState,
    #[error("address family mismatch: socket is {have}, requested {want}")]
    FamilyMismatch {
        have: AddressFamily,
        want: AddressFamily,
    },
    #[error("{0}")]
    SystemCall(#[from] io::Error),
    #[error("operation would block")]
    WouldBlock,
    #[error("connection terminated: {0}")]
    ConnectionTerminated(io::Error),
    #[error("timed out")]
    Timeout,
    #[error("socket table exhausted")]
    Exhausted,
    #[error("network module not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Translate a raw errno into the error vocabulary of this crate.
    pub(crate) fn from_errno(errno: i32) -> Error {
        let err = io::Error::from_raw_os_error(errno);
        match classify(errno) {
            ErrorClass::WouldBlock => Error::WouldBlock,
            ErrorClass::Terminated => Error::ConnectionTerminated(err),
            ErrorClass::Other => Error::SystemCall(err),
        }
    }
}

/// How a kernel error code affects a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Benign on non-blocking descriptors; retry later.
    WouldBlock,
    /// Irrecoverable connection loss; the socket must be closed.
    Terminated,
    Other,
}

/// Classify a raw errno value. In-progress connects fall under
/// `WouldBlock` so the connect completion policy can treat the
/// platform variants uniformly.
pub fn classify(errno: i32) -> ErrorClass {
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINPROGRESS {
        ErrorClass::WouldBlock
    } else if errno == libc::ECONNRESET
        || errno == libc::ECONNABORTED
        || errno == libc::EPIPE
        || errno == libc::ETIMEDOUT
        || errno == libc::ENOTCONN
        || errno == libc::ENETDOWN
        || errno == libc::ENETRESET
    {
        ErrorClass::Terminated
    } else {
        ErrorClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_teardown_codes() {
        assert_eq!(classify(libc::EAGAIN), ErrorClass::WouldBlock);
        assert_eq!(classify(libc::EINPROGRESS), ErrorClass::WouldBlock);
        assert_eq!(classify(libc::ECONNRESET), ErrorClass::Terminated);
        assert_eq!(classify(libc::EPIPE), ErrorClass::Terminated);
        assert_eq!(classify(libc::ETIMEDOUT), ErrorClass::Terminated);
        assert_eq!(classify(libc::ENOENT), ErrorClass::Other);
    }
}
