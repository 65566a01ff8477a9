//! Device registry: which keyboards are live, which are waiting for
//! hot-plug.
//!
//! Two disjoint buckets: `available` (grabbed, polled by the run loop) and
//! `pulled` (read-failed, presumed unplugged, state `Disabled`, awaiting a
//! matching `/dev/input` node). The bucket mutex is held only for membership
//! moves and snapshots; device I/O happens outside it against the per-device
//! locks.

use std::ffi::CString;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{GRAB_BACKOFF, GRAB_RETRIES, INPUT_GROUP, SETTLE_CAP, SETTLE_STEP};
use crate::device::KbdDevice;
use crate::error::DeviceError;

pub type SharedDevice = Arc<Mutex<KbdDevice>>;

#[derive(Default)]
struct Buckets {
    available: Vec<SharedDevice>,
    pulled: Vec<SharedDevice>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    buckets: Mutex<Buckets>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open and grab every CLI-supplied identity. A device that opens but
    /// will not grab within the retry budget is parked in `pulled`; an
    /// identity with no matching node at all is an error.
    pub fn populate(&self, identities: &[String]) -> Result<(), DeviceError> {
        for identity in identities {
            let path = resolve_identity(identity).ok_or_else(|| DeviceError::Open {
                path: PathBuf::from(identity),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no input device matches this identity",
                ),
            })?;
            let mut dev = KbdDevice::open(&path)?;
            if !dev.looks_like_keyboard() {
                warn!("{identity} ({}) reports no key events", path.display());
            }
            match grab_with_backoff(&mut dev) {
                Ok(()) => self.buckets.lock().available.push(Arc::new(Mutex::new(dev))),
                Err(e) => {
                    warn!("cannot grab {identity}: {e}; waiting for hot-plug");
                    dev.disable();
                    self.buckets.lock().pulled.push(Arc::new(Mutex::new(dev)));
                }
            }
        }
        Ok(())
    }

    /// Copy of the pollable devices. Taken before every poll so the bucket
    /// lock is not held across device I/O.
    pub fn snapshot(&self) -> Vec<SharedDevice> {
        self.buckets.lock().available.clone()
    }

    pub fn available_count(&self) -> usize {
        self.buckets.lock().available.len()
    }

    pub fn pulled_count(&self) -> usize {
        self.buckets.lock().pulled.len()
    }

    /// Move a read-failed device out of the poll set until a matching node
    /// reappears.
    pub fn park(&self, device: &SharedDevice) {
        let mut buckets = self.buckets.lock();
        let Some(idx) = buckets
            .available
            .iter()
            .position(|d| Arc::ptr_eq(d, device))
        else {
            return;
        };
        let dev = buckets.available.remove(idx);
        dev.lock().disable();
        info!("pulled {}", dev.lock().fingerprint());
        buckets.pulled.push(dev);
    }

    /// Hot-plug entry point: a node appeared (or changed) under
    /// `/dev/input`. Re-bind the first pulled device that identifies as it.
    pub fn handle_node_event(&self, path: &Path) {
        match std::fs::metadata(path) {
            Ok(stat) if stat.file_type().is_char_device() => {}
            _ => return,
        }
        if self.buckets.lock().pulled.is_empty() {
            return;
        }
        if !wait_for_settled_permissions(path) {
            warn!(
                "permissions on {} never settled; skipping",
                path.display()
            );
            return;
        }

        // Probe outside the bucket lock; identification and grabbing are
        // real I/O.
        let pulled = self.buckets.lock().pulled.clone();
        for candidate in pulled {
            let mut dev = candidate.lock();
            if !dev.is_me(path) {
                continue;
            }
            if let Err(e) = dev.reset(path).and_then(|()| dev.lock()) {
                warn!("re-bind of {} failed: {e}", path.display());
                return;
            }
            info!("re-bound {} to {}", dev.fingerprint(), path.display());
            drop(dev);

            let mut buckets = self.buckets.lock();
            if let Some(idx) = buckets
                .pulled
                .iter()
                .position(|d| Arc::ptr_eq(d, &candidate))
            {
                let dev = buckets.pulled.remove(idx);
                buckets.available.push(dev);
            }
            return;
        }
        debug!("{} matches no pulled device", path.display());
    }
}

fn grab_with_backoff(dev: &mut KbdDevice) -> Result<(), DeviceError> {
    let mut last = None;
    for attempt in 1..=GRAB_RETRIES {
        match dev.lock() {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("grab attempt {attempt} failed: {e}");
                last = Some(e);
                std::thread::sleep(GRAB_BACKOFF * attempt);
            }
        }
    }
    Err(last.unwrap_or(DeviceError::Grab(std::io::Error::new(
        std::io::ErrorKind::Other,
        "no grab attempt ran",
    ))))
}

/// Map a CLI identity to a device node. A leading `/` is an explicit path;
/// anything else is matched against the enumerated devices' names and
/// fingerprints.
fn resolve_identity(identity: &str) -> Option<PathBuf> {
    if identity.starts_with('/') {
        return Some(PathBuf::from(identity));
    }
    for (path, _) in evdev::enumerate() {
        if let Ok(dev) = KbdDevice::open(&path) {
            if dev.identity_matches(identity) {
                return Some(path);
            }
        }
    }
    None
}

/// Freshly created event nodes briefly appear as `root:root 0600` until
/// udev applies its rules. Busy-wait in small steps until the node is
/// group-owned by `input` with group r/w, or give up at the cap.
fn wait_for_settled_permissions(path: &Path) -> bool {
    let Some(gid) = input_group_gid() else {
        // No input group on this system; nothing to wait for.
        return true;
    };
    let deadline = Instant::now() + SETTLE_CAP;
    loop {
        if let Ok(stat) = std::fs::metadata(path) {
            if stat.gid() == gid && stat.mode() & 0o060 == 0o060 {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(SETTLE_STEP);
    }
}

fn input_group_gid() -> Option<u32> {
    static GID: OnceLock<Option<u32>> = OnceLock::new();
    *GID.get_or_init(|| {
        let name = CString::new(INPUT_GROUP).ok()?;
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = [0 as libc::c_char; 1024];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(
                name.as_ptr(),
                &mut grp,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc == 0 && !result.is_null() {
            Some(grp.gr_gid)
        } else {
            None
        }
    })
}
