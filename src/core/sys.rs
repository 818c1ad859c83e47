// Thin libc wrappers for readiness polling, pending-byte queries, and descriptor checks.
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

pub(crate) type PollFd = libc::pollfd;

pub(crate) const READABLE: libc::c_short = libc::POLLIN;
pub(crate) const INVALID: libc::c_short = libc::POLLNVAL;

pub(crate) fn poll_entry(fd: RawFd, events: libc::c_short) -> PollFd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(value) => value.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// Blocks until one of `fds` is ready or `timeout` passes; returns the
/// number of entries with non-zero `revents`.
pub(crate) fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> io::Result<usize> {
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_ms(timeout),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// `true` if `fd` can take a write (or has an error pending) within `timeout`.
pub(crate) fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut entry = [poll_entry(fd, libc::POLLOUT)];
    let ready = poll(&mut entry, Some(timeout))?;
    Ok(ready > 0 && entry[0].revents != 0)
}

/// Bytes the kernel reports as immediately readable on `fd`.
pub(crate) fn bytes_available(fd: RawFd) -> io::Result<usize> {
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending as *mut libc::c_int) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending.max(0) as usize)
}

/// Receives one datagram. On Linux the returned length is the datagram's full
/// size even when it was truncated; elsewhere it is capped at `buf.len()`, so
/// callers detect truncation with a buffer one byte larger than they accept.
pub(crate) fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_TRUNC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// `false` only when the kernel says the descriptor is not open.
pub(crate) fn descriptor_is_open(fd: RawFd) -> bool {
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if rc != -1 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::EBADF)
}

/// Closes `fd`, reporting the result instead of swallowing it like `Drop`.
pub(crate) fn close(fd: OwnedFd) -> io::Result<()> {
    use std::os::fd::IntoRawFd;
    let raw = fd.into_raw_fd();
    if unsafe { libc::close(raw) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
