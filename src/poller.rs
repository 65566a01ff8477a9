//! Readiness multiplexer over device file descriptors.
//!
//! A thin wrapper around `poll(2)`: waits on a snapshot of device fds plus
//! the shutdown token and reports which device is readable. When several fds
//! are ready at once the lowest index wins, which keeps delivery order stable
//! across iterations.

use std::io;
use std::os::unix::io::RawFd;

use crate::shutdown::Shutdown;

/// Outcome of one multiplexer wait.
#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    /// `fds[i]` is readable (or in an error state that a read will surface).
    Device(usize),
    Timeout,
    Shutdown,
}

/// Wait up to `timeout_ms` for one of `fds` or the shutdown token.
///
/// Error and hangup conditions count as readable so the subsequent read can
/// report the device's disappearance. `EINTR` folds into a timeout; the
/// caller loops anyway.
pub fn wait_readable(
    fds: &[RawFd],
    shutdown: &Shutdown,
    timeout_ms: i32,
) -> io::Result<Readiness> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    pollfds.push(libc::pollfd {
        fd: shutdown.fd(),
        events: libc::POLLIN,
        revents: 0,
    });

    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::Timeout);
        }
        return Err(err);
    }
    if rc == 0 {
        return Ok(Readiness::Timeout);
    }

    // Shutdown preempts pending device input.
    if pollfds[fds.len()].revents & libc::POLLIN != 0 {
        return Ok(Readiness::Shutdown);
    }

    let ready = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
    for (idx, p) in pollfds[..fds.len()].iter().enumerate() {
        if p.revents & ready != 0 {
            return Ok(Readiness::Device(idx));
        }
    }
    Ok(Readiness::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn write_byte(fd: RawFd) {
        let b = [0u8];
        assert_eq!(
            unsafe { libc::write(fd, b.as_ptr() as *const libc::c_void, 1) },
            1
        );
    }

    fn close_all(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn reports_readable_device() {
        let shutdown = Shutdown::new().unwrap();
        let (r, w) = pipe();
        write_byte(w);
        let out = wait_readable(&[r], &shutdown, 100).unwrap();
        assert_eq!(out, Readiness::Device(0));
        close_all(&[r, w]);
    }

    #[test]
    fn lowest_index_wins() {
        let shutdown = Shutdown::new().unwrap();
        let (r0, w0) = pipe();
        let (r1, w1) = pipe();
        write_byte(w1);
        write_byte(w0);
        let out = wait_readable(&[r0, r1], &shutdown, 100).unwrap();
        assert_eq!(out, Readiness::Device(0));
        close_all(&[r0, w0, r1, w1]);
    }

    #[test]
    fn times_out_when_idle() {
        let shutdown = Shutdown::new().unwrap();
        let (r, w) = pipe();
        let out = wait_readable(&[r], &shutdown, 10).unwrap();
        assert_eq!(out, Readiness::Timeout);
        close_all(&[r, w]);
    }

    #[test]
    fn shutdown_preempts_ready_devices() {
        let shutdown = Shutdown::new().unwrap();
        let (r, w) = pipe();
        write_byte(w);
        shutdown.trigger();
        let out = wait_readable(&[r], &shutdown, 100).unwrap();
        assert_eq!(out, Readiness::Shutdown);
        close_all(&[r, w]);
    }

    #[test]
    fn hangup_counts_as_readable() {
        let shutdown = Shutdown::new().unwrap();
        let (r, w) = pipe();
        unsafe { libc::close(w) };
        let out = wait_readable(&[r], &shutdown, 100).unwrap();
        assert_eq!(out, Readiness::Device(0));
        close_all(&[r]);
    }
}
