//! The passthrough key set.
//!
//! Union of key codes contributed by the CSV files in the keys directory.
//! Only codes in this set ever reach the macro daemon; everything else is
//! re-emitted verbatim. Loading is gated on file credentials: a
//! world-writable or foreign-owned CSV would let an unprivileged user
//! opt arbitrary keys into exfiltration.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use inotify::EventMask;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::ReloadError;
use crate::fswatch::{FsEvent, FsWatcher};

/// Permission bits a key CSV must carry, exactly.
const REQUIRED_MODE: u32 = 0o644;

#[derive(Default)]
struct Sources {
    /// Canonical path → codes contributed by that file.
    key_sources: HashMap<PathBuf, Vec<u16>>,
    /// Union over all sources.
    codes: HashSet<u16>,
}

impl Sources {
    fn unload(&mut self, path: &Path) -> bool {
        if self.key_sources.remove(path).is_none() {
            return false;
        }
        // Two files may contribute the same code; rebuild the union from
        // what remains rather than subtracting.
        self.codes.clear();
        for codes in self.key_sources.values() {
            self.codes.extend(codes.iter().copied());
        }
        true
    }

    fn insert(&mut self, path: PathBuf, codes: Vec<u16>) {
        self.codes.extend(codes.iter().copied());
        self.key_sources.insert(path, codes);
    }
}

pub struct PassthroughSet {
    inner: Mutex<Sources>,
}

impl Default for PassthroughSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughSet {
    pub fn new() -> Self {
        PassthroughSet {
            inner: Mutex::new(Sources::default()),
        }
    }

    /// Is `code` routed to the macro daemon?
    pub fn contains(&self, code: u16) -> bool {
        self.inner.lock().codes.contains(&code)
    }

    /// Number of distinct passthrough codes.
    pub fn len(&self) -> usize {
        self.inner.lock().codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().codes.is_empty()
    }

    /// Load (or reload) one CSV. On any failure the file's prior
    /// contribution, if any, is left intact.
    pub fn load(&self, watcher: &FsWatcher, path: &Path) -> Result<usize, ReloadError> {
        let canonical = std::fs::canonicalize(path).map_err(|source| ReloadError::Path {
            path: path.to_path_buf(),
            source,
        })?;
        let stat = std::fs::metadata(&canonical).map_err(|source| ReloadError::Path {
            path: canonical.clone(),
            source,
        })?;
        if !stat.is_file() {
            return Err(ReloadError::NotAFile(canonical));
        }

        let want_uid = unsafe { libc::geteuid() };
        let mode = stat.mode() & 0o777;
        if mode != REQUIRED_MODE || stat.uid() != want_uid {
            return Err(ReloadError::Perm {
                path: canonical,
                mode,
                uid: stat.uid(),
                want_uid,
            });
        }

        let codes = read_key_codes(&canonical)?;
        let count = codes.len();
        {
            let mut inner = self.inner.lock();
            inner.unload(&canonical);
            inner.insert(canonical.clone(), codes);
        }
        if let Err(e) = watcher.add(&canonical) {
            // Missing hot-reload is degradation, not data loss.
            warn!("cannot watch {}: {e}", canonical.display());
        }
        info!("loaded {} ({count} codes)", canonical.display());
        Ok(count)
    }

    /// Drop a file's contribution. Unloading an unknown path is a no-op.
    pub fn unload(&self, path: &Path) {
        if self.inner.lock().unload(path) {
            info!("removed {}", path.display());
        }
    }

    /// Hot-reload dispatch for one watcher event on the keys directory.
    pub fn handle_event(&self, watcher: &FsWatcher, ev: &FsEvent) {
        if ev.mask.contains(EventMask::DELETE_SELF) || ev.mask.contains(EventMask::MOVE_SELF) {
            watcher.remove(&ev.path);
            self.unload(&ev.path);
            return;
        }
        let changed = EventMask::CREATE | EventMask::MODIFY | EventMask::MOVED_TO;
        if ev.added || ev.mask.intersects(changed) {
            match self.load(watcher, &ev.path) {
                Ok(_) => {}
                Err(ReloadError::NotAFile(p)) => debug!("skipping non-file {}", p.display()),
                Err(e) => warn!("{e}"),
            }
        }
    }
}

/// Extract the `key_code` column. Cells that do not parse as a non-negative
/// integer are skipped; future revisions may put comments or extra headers
/// in these files.
fn read_key_codes(path: &Path) -> Result<Vec<u16>, ReloadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h.trim() == "key_code")
        .ok_or_else(|| ReloadError::MissingColumn(path.to_path_buf()))?;

    let mut codes = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(cell) = record.get(column) else {
            continue;
        };
        if let Ok(value) = cell.trim().parse::<i64>() {
            if (0..=i64::from(u16::MAX)).contains(&value) {
                codes.push(value as u16);
            }
        }
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_csv(dir: &Path, name: &str, codes: &[i64], mode: u32) -> PathBuf {
        let path = dir.join(name);
        let mut body = String::from("key_code\n");
        for c in codes {
            body.push_str(&format!("{c}\n"));
        }
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn union_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();

        let a = write_csv(dir.path(), "a.csv", &[30], 0o644);
        let b = write_csv(dir.path(), "b.csv", &[31, 32], 0o644);
        set.load(&watcher, &a).unwrap();
        set.load(&watcher, &b).unwrap();

        assert!(set.contains(30));
        assert!(set.contains(31));
        assert!(set.contains(32));
        assert!(!set.contains(33));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn unload_rebuilds_overlapping_union() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();

        let a = write_csv(dir.path(), "a.csv", &[30], 0o644);
        let b = write_csv(dir.path(), "b.csv", &[30, 31], 0o644);
        let a = set_canonical(&set, &watcher, &a);
        let b = set_canonical(&set, &watcher, &b);

        set.unload(&b);
        assert!(set.contains(30), "still contributed by a.csv");
        assert!(!set.contains(31));

        set.unload(&a);
        assert!(set.is_empty());
    }

    fn set_canonical(set: &PassthroughSet, watcher: &FsWatcher, path: &Path) -> PathBuf {
        set.load(watcher, path).unwrap();
        fs::canonicalize(path).unwrap()
    }

    #[test]
    fn unload_of_unknown_path_is_noop() {
        let set = PassthroughSet::new();
        set.unload(Path::new("/nonexistent/keys.csv"));
        assert!(set.is_empty());
    }

    #[test]
    fn wrong_mode_rejected_and_set_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();

        let loose = write_csv(dir.path(), "loose.csv", &[30], 0o666);
        assert!(matches!(
            set.load(&watcher, &loose),
            Err(ReloadError::Perm { .. })
        ));
        assert!(set.is_empty());

        let tight = write_csv(dir.path(), "tight.csv", &[30], 0o600);
        assert!(matches!(
            set.load(&watcher, &tight),
            Err(ReloadError::Perm { .. })
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn failed_reload_keeps_prior_contribution() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();

        let path = write_csv(dir.path(), "keys.csv", &[30], 0o644);
        set.load(&watcher, &path).unwrap();
        assert!(set.contains(30));

        // File goes world-writable; the reload must be rejected and the
        // previous codes must stay in force.
        write_csv(dir.path(), "keys.csv", &[99], 0o666);
        assert!(set.load(&watcher, &path).is_err());
        assert!(set.contains(30));
        assert!(!set.contains(99));
    }

    #[test]
    fn unparsable_cells_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.csv");
        fs::write(&path, "key_code,comment\n30,space bar\nnot-a-number,x\n-5,y\n31,\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();
        let count = set.load(&watcher, &path).unwrap();
        assert_eq!(count, 2);
        assert!(set.contains(30));
        assert!(set.contains(31));
    }

    #[test]
    fn missing_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.csv");
        fs::write(&path, "code\n30\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();
        assert!(matches!(
            set.load(&watcher, &path),
            Err(ReloadError::MissingColumn(_))
        ));
    }

    #[test]
    fn delete_event_unloads_and_create_event_loads() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FsWatcher::new().unwrap();
        let set = PassthroughSet::new();

        let path = write_csv(dir.path(), "keys.csv", &[30], 0o644);
        let canonical = set_canonical(&set, &watcher, &path);

        set.handle_event(
            &watcher,
            &FsEvent {
                path: canonical.clone(),
                mask: EventMask::DELETE_SELF,
                stat: None,
                added: false,
            },
        );
        assert!(!set.contains(30));

        set.handle_event(
            &watcher,
            &FsEvent {
                path: path.clone(),
                mask: EventMask::CREATE,
                stat: fs::metadata(&path).ok(),
                added: false,
            },
        );
        assert!(set.contains(30));
    }
}
