//! The main event pipeline and its two filesystem reactors.
//!
//! One iteration: snapshot the available devices, wait for readiness, read
//! one key event, gate on grab state, then either round-trip the event
//! through the macro daemon (passthrough hit) or re-emit it verbatim on the
//! virtual keyboard. A key the user physically pressed always reaches the
//! OS unless the macro daemon successfully took ownership of it.

use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{MAX_SOCKET_ERRORS, POLL_TIMEOUT_MS, WATCH_TIMEOUT_MS};
use crate::device::DeviceState;
use crate::emitter::VirtualOut;
use crate::error::{DaemonError, SocketError};
use crate::fswatch::{log_degraded, FsWatcher};
use crate::passthrough::PassthroughSet;
use crate::poller::{wait_readable, Readiness};
use crate::registry::DeviceRegistry;
use crate::shutdown::Shutdown;
use crate::socket::FrameSocket;
use crate::wire::{Action, KeyEvent};

/// Consecutive macro-daemon failures, reset on every successful round-trip.
#[derive(Debug, Default)]
pub struct ErrorBudget {
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure; true means the budget is exhausted.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive > MAX_SOCKET_ERRORS
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

pub struct KbdDaemon {
    registry: Arc<DeviceRegistry>,
    passthrough: Arc<PassthroughSet>,
    socket: FrameSocket,
    out: VirtualOut,
    shutdown: Arc<Shutdown>,
    budget: ErrorBudget,
}

impl KbdDaemon {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        passthrough: Arc<PassthroughSet>,
        socket: FrameSocket,
        out: VirtualOut,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        KbdDaemon {
            registry,
            passthrough,
            socket,
            out,
            shutdown,
            budget: ErrorBudget::new(),
        }
    }

    /// Run until shutdown or error-budget exhaustion.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        info!(
            "pipeline running: {} device(s), {} passthrough code(s)",
            self.registry.available_count(),
            self.passthrough.len()
        );
        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            let snapshot = self.registry.snapshot();
            let fds: Vec<RawFd> = snapshot.iter().map(|d| d.lock().as_raw_fd()).collect();

            // With every device pulled this degenerates to a shutdown-aware
            // sleep; hot-plug re-binds happen on the reactor thread.
            let idx = match wait_readable(&fds, &self.shutdown, POLL_TIMEOUT_MS)
                .map_err(DaemonError::Poll)?
            {
                Readiness::Shutdown => return Ok(()),
                Readiness::Timeout => continue,
                Readiness::Device(idx) => idx,
            };

            let device = &snapshot[idx];
            let (fetched, state) = {
                let mut dev = device.lock();
                (dev.get(), dev.state())
            };
            let ev = match fetched {
                Ok(Some(ev)) => ev,
                Ok(None) => continue,
                Err(e) => {
                    // Disappeared mid-read; hand it to the hot-plug path.
                    // Device loss never counts against the socket budget.
                    warn!("{e}");
                    self.registry.park(device);
                    continue;
                }
            };

            // A device mid-re-bind is not exclusively ours; forwarding its
            // events would leak keystrokes other readers also saw.
            if state != DeviceState::Locked {
                debug!("discarding event from ungrabbed device");
                continue;
            }

            if self.passthrough.contains(ev.code) {
                match self.relay(ev) {
                    Ok(()) => {
                        self.out.flush().map_err(DaemonError::Emit)?;
                        self.budget.reset();
                        // The macro daemon owns this key now; no verbatim
                        // re-emit.
                        continue;
                    }
                    Err(e) => {
                        warn!("macro daemon round-trip failed: {e}");
                        if self.budget.record_failure() {
                            error!(
                                "{} consecutive socket errors; giving up",
                                self.budget.consecutive()
                            );
                            // EOF tells the macro daemon to terminate.
                            self.socket.close();
                            self.shutdown.trigger();
                            return Err(DaemonError::MacroDaemonLost {
                                errors: self.budget.consecutive(),
                            });
                        }
                        // Fall through: the user still sees the key.
                    }
                }
            }

            self.out.emit(ev);
            self.out.flush().map_err(DaemonError::Emit)?;
        }
    }

    /// Hand one passthrough key to the macro daemon and queue its rewrite
    /// burst. The terminating `done` sentinel carries no event.
    fn relay(&mut self, ev: KeyEvent) -> Result<(), SocketError> {
        self.socket.send(&Action::event(ev))?;
        loop {
            let resp = self.socket.recv()?;
            if resp.done {
                return Ok(());
            }
            self.out.emit(resp.ev);
        }
    }
}

/// Reactor: keys-directory watch stream → passthrough set mutations.
pub fn passthrough_reactor(
    watcher: Arc<FsWatcher>,
    set: Arc<PassthroughSet>,
    shutdown: Arc<Shutdown>,
) {
    while !shutdown.is_triggered() {
        match watcher.next_batch(&shutdown, WATCH_TIMEOUT_MS) {
            Ok(None) => break,
            Ok(Some(events)) => {
                for ev in &events {
                    set.handle_event(&watcher, ev);
                }
            }
            Err(e) => {
                log_degraded(&e);
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }
    }
    debug!("passthrough reactor stopped");
}

/// Reactor: `/dev/input` watch stream → hot-plug re-binds.
pub fn hotplug_reactor(
    watcher: Arc<FsWatcher>,
    registry: Arc<DeviceRegistry>,
    input_dir: &Path,
    shutdown: Arc<Shutdown>,
) {
    while !shutdown.is_triggered() {
        match watcher.next_batch(&shutdown, WATCH_TIMEOUT_MS) {
            Ok(None) => break,
            Ok(Some(events)) => {
                for ev in &events {
                    // Events on the directory itself carry no node path.
                    if ev.path != input_dir {
                        registry.handle_node_event(&ev.path);
                    }
                }
            }
            Err(e) => {
                log_degraded(&e);
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }
    }
    debug!("hot-plug reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_resets_on_success() {
        let mut budget = ErrorBudget::new();
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert_eq!(budget.consecutive(), 2);
        budget.reset();
        assert_eq!(budget.consecutive(), 0);
    }

    #[test]
    fn budget_exhausts_strictly_above_max() {
        let mut budget = ErrorBudget::new();
        for _ in 0..MAX_SOCKET_ERRORS {
            assert!(!budget.record_failure());
        }
        // One past the budget is fatal.
        assert!(budget.record_failure());
        assert_eq!(budget.consecutive(), MAX_SOCKET_ERRORS + 1);
    }
}
