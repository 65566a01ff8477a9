//! Length-framed unix socket to the macro daemon.
//!
//! The keyboard daemon owns the listener; the macro daemon connects to the
//! well-known path under the privileged state directory. Frames are the
//! fixed-size records from [`crate::wire`]. The listener is non-blocking and
//! a pending connection is adopted at the next `send`, which is what makes
//! the channel reconnect-capable between pipeline iterations without ever
//! retrying inside one.

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::RECV_DEADLINE;
use crate::error::SocketError;
use crate::wire::{Action, ACTION_SIZE};

pub struct FrameSocket {
    listener: UnixListener,
    conn: Option<UnixStream>,
    path: PathBuf,
}

impl FrameSocket {
    /// Bind the well-known socket path, replacing any stale socket file left
    /// by a previous run.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("listening on {}", path.display());
        Ok(FrameSocket {
            listener,
            conn: None,
            path: path.to_path_buf(),
        })
    }

    /// Adopt any pending connection, newest first. A macro daemon that
    /// restarted replaces the dead stream it left behind.
    fn adopt_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(false).is_err()
                        || stream.set_read_timeout(Some(RECV_DEADLINE)).is_err()
                    {
                        warn!("rejecting macro daemon connection: setup failed");
                        continue;
                    }
                    info!("macro daemon connected");
                    self.conn = Some(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn stream(&mut self) -> Result<&mut UnixStream, SocketError> {
        self.adopt_pending();
        self.conn.as_mut().ok_or(SocketError::NotConnected)
    }

    /// Send one action record. On failure the connection is dropped and the
    /// error bubbles to the caller's error budget.
    pub fn send(&mut self, action: &Action) -> Result<(), SocketError> {
        let buf = action.encode();
        let result = self.stream()?.write_all(&buf);
        if let Err(e) = result {
            self.conn = None;
            return Err(SocketError::Io(e));
        }
        Ok(())
    }

    /// Receive one action record, bounded by the read deadline so a wedged
    /// macro daemon cannot stall keystroke delivery.
    pub fn recv(&mut self) -> Result<Action, SocketError> {
        let mut buf = [0u8; ACTION_SIZE];
        let stream = match self.conn.as_mut() {
            Some(s) => s,
            None => return Err(SocketError::NotConnected),
        };
        match stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) => {
                self.conn = None;
                return Err(match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SocketError::Timeout,
                    io::ErrorKind::UnexpectedEof => SocketError::Disconnected,
                    _ => SocketError::Io(e),
                });
            }
        }
        match Action::decode(&buf) {
            Ok(action) => Ok(action),
            Err(e) => {
                // A peer speaking garbage is as good as gone.
                self.conn = None;
                Err(e)
            }
        }
    }

    /// Drop the peer connection. Used before a fatal exit so the macro
    /// daemon observes EOF and can terminate.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

impl Drop for FrameSocket {
    fn drop(&mut self) {
        self.close();
        let _ = std::fs::remove_file(&self.path);
    }
}
