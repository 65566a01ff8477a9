//! Self-pipe shutdown token.
//!
//! Every blocking wait in the daemon (device multiplexer, inotify reactors)
//! polls the token's read end alongside its own fds, so termination does not
//! race with a worker parked in a long read. The pipe is never drained:
//! once triggered it stays level-readable for every thread.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Shutdown {
    triggered: AtomicBool,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Shutdown {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Shutdown {
            triggered: AtomicBool::new(false),
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Request termination. Safe to call from any thread, more than once.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let byte = [1u8];
            unsafe {
                libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Read end, for weaving into poll sets.
    pub fn fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_sticky_and_visible() {
        let s = Shutdown::new().unwrap();
        assert!(!s.is_triggered());
        s.trigger();
        s.trigger();
        assert!(s.is_triggered());
    }
}
