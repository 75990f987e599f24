//! `poll(2)` readiness waits shared by the session manager and the stream multiplexer.
//!
//! Both loops block in exactly one place per iteration: a bounded wait on a handful of
//! descriptors. A timeout is not an error; callers simply go around again.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub fd: RawFd,
    pub interest: Interest,
}

impl Registration {
    pub fn read(fd: &impl AsRawFd) -> Self {
        Self {
            fd: fd.as_raw_fd(),
            interest: Interest::Read,
        }
    }

    pub fn write(fd: &impl AsRawFd) -> Self {
        Self {
            fd: fd.as_raw_fd(),
            interest: Interest::Write,
        }
    }
}

/// Wait until at least one registration is ready or `timeout` elapses.
///
/// Returns one flag per registration, in order. Hang-up and error conditions count as ready
/// so the following read/write surfaces the failure. A wait interrupted by a signal reports
/// nothing ready.
pub fn wait(registrations: &[Registration], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut fds: Vec<libc::pollfd> = registrations
        .iter()
        .map(|r| libc::pollfd {
            fd: r.fd,
            events: match r.interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            },
            revents: 0,
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    let mask = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;
    Ok(fds
        .iter()
        .map(|p| p.revents & (p.events | mask) != 0)
        .collect())
}

/// Wait for a single descriptor to become readable.
pub fn wait_readable(fd: &impl AsRawFd, timeout: Duration) -> io::Result<bool> {
    let ready = wait(&[Registration::read(fd)], timeout)?;
    Ok(ready.first().copied().unwrap_or(false))
}

/// Put a descriptor that std offers no toggle for (e.g. a child's stdin pipe) in
/// non-blocking mode.
pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
