//! Platform descriptor primitives. Everything the crate needs from the
//! kernel socket layer funnels through here, so a port to another platform
//! touches this module only.

use std::io;
use std::mem;
use std::ptr;

pub(crate) type Fd = libc::c_int;
pub(crate) const INVALID_FD: Fd = -1;

pub(crate) fn last_errno() -> i32 {
    nix::errno::errno()
}

pub(crate) fn set_blocking_fd(fd: Fd, block: bool) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return;
        }
        let flags = if block {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };
        libc::fcntl(fd, libc::F_SETFL, flags);
    }
}

/// Full-duplex shutdown followed by close. The shutdown error on a
/// descriptor that never connected is discarded.
pub(crate) fn close_fd(fd: Fd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
        libc::close(fd);
    }
}

/// FIONREAD probe: -1 when the descriptor reports an error with nothing
/// buffered, otherwise the number of kernel-buffered bytes.
pub(crate) fn available_fd(fd: Fd) -> i32 {
    if fd == INVALID_FD {
        return -1;
    }
    let mut available: libc::c_int = 0;
    let closed =
        unsafe { libc::ioctl(fd, libc::FIONREAD as _, &mut available as *mut libc::c_int) } < 0;
    if available == 0 && closed {
        -1
    } else {
        available
    }
}

/// Zero-timeout probe of an in-progress connect: (writable, excepted).
pub(crate) fn probe_connect(fd: Fd) -> (bool, bool) {
    unsafe {
        let mut write_set: libc::fd_set = mem::zeroed();
        let mut err_set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut write_set);
        libc::FD_ZERO(&mut err_set);
        libc::FD_SET(fd, &mut write_set);
        libc::FD_SET(fd, &mut err_set);

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        libc::select(
            fd + 1,
            ptr::null_mut(),
            &mut write_set,
            &mut err_set,
            &mut tv,
        );

        (
            libc::FD_ISSET(fd, &write_set),
            libc::FD_ISSET(fd, &err_set),
        )
    }
}

/// select() with a millisecond timeout. `write` arms the write set,
/// otherwise the read set; the except set is always armed. Ok(true) means
/// the descriptor (or its except condition) became ready; the caller
/// retries the pending operation and finds out which.
pub(crate) fn wait_fd(fd: Fd, write: bool, timeout_ms: u32) -> io::Result<bool> {
    unsafe {
        let mut io_set: libc::fd_set = mem::zeroed();
        let mut err_set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut io_set);
        libc::FD_ZERO(&mut err_set);
        libc::FD_SET(fd, &mut io_set);
        libc::FD_SET(fd, &mut err_set);

        let mut tv = libc::timeval {
            tv_sec: (timeout_ms / 1000) as libc::time_t,
            tv_usec: ((timeout_ms % 1000) * 1000) as libc::suseconds_t,
        };

        let (read_set, write_set) = if write {
            (ptr::null_mut(), &mut io_set as *mut libc::fd_set)
        } else {
            (&mut io_set as *mut libc::fd_set, ptr::null_mut())
        };

        match libc::select(fd + 1, read_set, write_set, &mut err_set, &mut tv) {
            0 => Ok(false),
            n if n > 0 => Ok(true),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

/// Read and clear SO_ERROR.
pub(crate) fn take_socket_error(fd: Fd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        );
    }
    err
}

pub(crate) fn set_option(
    fd: Fd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn set_option_byte(
    fd: Fd,
    level: libc::c_int,
    name: libc::c_int,
    value: u8,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<u8>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
