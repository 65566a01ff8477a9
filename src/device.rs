//! One exclusively-grabbed physical keyboard.
//!
//! A device keeps a stable identity fingerprint (bus ids + kernel name) that
//! survives unplug/replug, so a hot-plugged `/dev/input/eventN` node can be
//! matched back to the device that lost its fd.

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use evdev::{Device, EventType, InputEvent};
use tracing::{debug, info};

use crate::error::DeviceError;
use crate::wire::KeyEvent;

/// Grab lifecycle of a device.
///
/// ```text
/// Initial --lock--> Locked --read error--> Disabled --reset+lock--> Locked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Initial,
    Locked,
    Disabled,
}

pub struct KbdDevice {
    dev: Device,
    fingerprint: String,
    path: PathBuf,
    state: DeviceState,
    pending: VecDeque<KeyEvent>,
}

/// Identity string for a device node: `vendor:product:name`.
fn fingerprint_of(dev: &Device) -> String {
    let id = dev.input_id();
    format!(
        "{:04x}:{:04x}:{}",
        id.vendor(),
        id.product(),
        dev.name().unwrap_or("unknown")
    )
}

fn key_event_from(ev: &InputEvent) -> KeyEvent {
    let (tv_sec, tv_usec) = match ev.timestamp().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_micros() as i64),
        Err(_) => (0, 0),
    };
    KeyEvent {
        tv_sec,
        tv_usec,
        code: ev.code(),
        value: ev.value(),
    }
}

impl KbdDevice {
    /// Open the kernel input device. Fails if the node is absent or is not
    /// an event device.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let dev = Device::open(path).map_err(|source| DeviceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let fingerprint = fingerprint_of(&dev);
        Ok(KbdDevice {
            dev,
            fingerprint,
            path: path.to_path_buf(),
            state: DeviceState::Initial,
            pending: VecDeque::new(),
        })
    }

    /// Request the exclusive grab. Idempotent; a device someone else holds
    /// fails with `DeviceError::Grab` and the caller retries after backoff.
    pub fn lock(&mut self) -> Result<(), DeviceError> {
        if self.state == DeviceState::Locked {
            return Ok(());
        }
        self.dev.grab().map_err(DeviceError::Grab)?;
        self.state = DeviceState::Locked;
        info!("grabbed {} ({})", self.path.display(), self.fingerprint);
        Ok(())
    }

    /// Read the next key event, if one is available.
    ///
    /// Only called after the multiplexer reports readability, so the single
    /// read underneath does not stall the pipeline. Non-key events in the
    /// batch are dropped; the virtual sink emits its own syn reports.
    /// `ENODEV`/`EIO` mean the device went away.
    pub fn get(&mut self) -> Result<Option<KeyEvent>, DeviceError> {
        if let Some(ev) = self.pending.pop_front() {
            return Ok(Some(ev));
        }
        match self.dev.fetch_events() {
            Ok(events) => {
                for ev in events {
                    if ev.event_type() == EventType::KEY {
                        self.pending.push_back(key_event_from(&ev));
                    }
                }
                Ok(self.pending.pop_front())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(DeviceError::Read(e)),
        }
    }

    /// Swap in a new device node after hot-plug, preserving identity.
    /// The old fd is closed; the grab must be re-acquired via [`lock`].
    ///
    /// [`lock`]: KbdDevice::lock
    pub fn reset(&mut self, new_path: &Path) -> Result<(), DeviceError> {
        let dev = Device::open(new_path).map_err(|source| DeviceError::Open {
            path: new_path.to_path_buf(),
            source,
        })?;
        debug!(
            "reset {} -> {}",
            self.path.display(),
            new_path.display()
        );
        self.dev = dev;
        self.path = new_path.to_path_buf();
        self.pending.clear();
        Ok(())
    }

    /// Does the node at `path` identify as this device? The probe fd is
    /// owned by the temporary handle and closed on every exit path.
    pub fn is_me(&self, path: &Path) -> bool {
        match Device::open(path) {
            Ok(probe) => fingerprint_of(&probe) == self.fingerprint,
            Err(_) => false,
        }
    }

    pub fn disable(&mut self) {
        self.state = DeviceState::Disabled;
        self.pending.clear();
    }

    pub fn is_disabled(&self) -> bool {
        self.state == DeviceState::Disabled
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Does this device answer to the CLI-supplied identity? Either the
    /// kernel name or the full fingerprint matches.
    pub fn identity_matches(&self, identity: &str) -> bool {
        self.fingerprint == identity || self.dev.name() == Some(identity)
    }

    /// True for devices that report key events at all; filters out mice,
    /// lid switches and the like during startup enumeration.
    pub fn looks_like_keyboard(&self) -> bool {
        self.dev.supported_events().contains(EventType::KEY)
    }
}

impl AsRawFd for KbdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.dev.as_raw_fd()
    }
}
