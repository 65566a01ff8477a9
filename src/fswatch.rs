//! Filesystem watch subscriptions (inotify).
//!
//! Used twice: on the passthrough keys directory and on `/dev/input`. The
//! watcher keeps path↔descriptor maps so events come back with absolute
//! paths, and synthesizes `added` events for files already present when a
//! directory subscription starts.
//!
//! Reads happen in two steps: the raw inotify fd is polled (together with
//! the shutdown token) outside the internal lock, then the ready batch is
//! drained non-blocking under it. That keeps `add` callable from the
//! passthrough loader while a reactor thread is waiting.

use std::collections::HashMap;
use std::fs;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::WatchError;
use crate::poller::{wait_readable, Readiness};
use crate::shutdown::Shutdown;

const EVENT_BUF_LEN: usize = 4096;

fn file_mask() -> WatchMask {
    WatchMask::MODIFY | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF
}

fn dir_mask() -> WatchMask {
    WatchMask::CREATE | WatchMask::MODIFY | WatchMask::MOVED_TO | WatchMask::ATTRIB
}

/// One filesystem event, resolved to an absolute path.
#[derive(Debug)]
pub struct FsEvent {
    pub path: PathBuf,
    pub mask: EventMask,
    /// Metadata captured when the event was read; `None` if the path was
    /// already gone.
    pub stat: Option<fs::Metadata>,
    /// True for events synthesized by [`FsWatcher::add_dir`] for files that
    /// existed before the subscription.
    pub added: bool,
}

struct Inner {
    inotify: Inotify,
    path_to_wd: HashMap<PathBuf, WatchDescriptor>,
    wd_to_path: HashMap<WatchDescriptor, PathBuf>,
}

pub struct FsWatcher {
    fd: RawFd,
    inner: Mutex<Inner>,
}

impl FsWatcher {
    pub fn new() -> Result<Self, WatchError> {
        let inotify = Inotify::init().map_err(WatchError::Init)?;
        Ok(FsWatcher {
            fd: inotify.as_raw_fd(),
            inner: Mutex::new(Inner {
                inotify,
                path_to_wd: HashMap::new(),
                wd_to_path: HashMap::new(),
            }),
        })
    }

    /// Watch a single file. Watching a path twice is a no-op.
    pub fn add(&self, path: &Path) -> Result<(), WatchError> {
        self.add_with_mask(path, file_mask())
    }

    fn add_with_mask(&self, path: &Path, mask: WatchMask) -> Result<(), WatchError> {
        let mut inner = self.inner.lock();
        if inner.path_to_wd.contains_key(path) {
            return Ok(());
        }
        let wd = inner
            .inotify
            .watches()
            .add(path, mask)
            .map_err(|source| WatchError::Add {
                path: path.to_path_buf(),
                source,
            })?;
        inner.path_to_wd.insert(path.to_path_buf(), wd.clone());
        inner.wd_to_path.insert(wd, path.to_path_buf());
        debug!("watching {}", path.display());
        Ok(())
    }

    /// Stop watching a path. Removing an unwatched path is a no-op.
    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(wd) = inner.path_to_wd.remove(path) {
            inner.wd_to_path.remove(&wd);
            if let Err(e) = inner.inotify.watches().remove(wd) {
                // Already auto-removed by the kernel after DELETE_SELF.
                debug!("remove watch {}: {e}", path.display());
            }
        }
    }

    /// Watch a directory (not its subtree) and return synthetic `added`
    /// events for every regular file already inside it.
    pub fn add_dir(&self, path: &Path) -> Result<Vec<FsEvent>, WatchError> {
        self.add_with_mask(path, dir_mask())?;
        let mut found = Vec::new();
        let entries = fs::read_dir(path).map_err(|source| WatchError::Add {
            path: path.to_path_buf(),
            source,
        })?;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            match fs::metadata(&entry_path) {
                Ok(stat) if stat.is_file() => found.push(FsEvent {
                    path: entry_path,
                    mask: EventMask::empty(),
                    stat: Some(stat),
                    added: true,
                }),
                _ => {}
            }
        }
        Ok(found)
    }

    /// Wait for the next event batch.
    ///
    /// Returns `None` when the shutdown token fires, an empty batch on a
    /// quiet tick, and resolved events otherwise.
    pub fn next_batch(
        &self,
        shutdown: &Shutdown,
        timeout_ms: i32,
    ) -> Result<Option<Vec<FsEvent>>, WatchError> {
        match wait_readable(&[self.fd], shutdown, timeout_ms).map_err(WatchError::Read)? {
            Readiness::Shutdown => return Ok(None),
            Readiness::Timeout => return Ok(Some(Vec::new())),
            Readiness::Device(_) => {}
        }

        let mut inner = self.inner.lock();
        let mut buffer = [0u8; EVENT_BUF_LEN];
        let events = match inner.inotify.read_events(&mut buffer) {
            Ok(events) => events,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Some(Vec::new())),
            Err(e) => return Err(WatchError::Read(e)),
        };

        let mut batch: Vec<(WatchDescriptor, EventMask, Option<PathBuf>)> = Vec::new();
        for ev in events {
            batch.push((
                ev.wd.clone(),
                ev.mask,
                ev.name.map(|n| PathBuf::from(n.to_os_string())),
            ));
        }

        let mut out = Vec::new();
        for (wd, mask, name) in batch {
            let base = match inner.wd_to_path.get(&wd) {
                Some(p) => p.clone(),
                None => {
                    debug!("event for unknown watch descriptor, mask {mask:?}");
                    continue;
                }
            };
            if mask.contains(EventMask::IGNORED) {
                // Kernel dropped the watch (file deleted); forget it.
                inner.path_to_wd.remove(&base);
                inner.wd_to_path.remove(&wd);
                continue;
            }
            let path = match name {
                Some(n) => base.join(n),
                None => base,
            };
            let stat = fs::metadata(&path).ok();
            out.push(FsEvent {
                path,
                mask,
                stat,
                added: false,
            });
        }
        Ok(Some(out))
    }
}

/// Log-and-continue wrapper for reactor loops: a broken watcher degrades
/// hot-reload, it must not take keystroke delivery down with it.
pub fn log_degraded(err: &WatchError) {
    warn!("filesystem watcher degraded: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn drain(watcher: &FsWatcher, shutdown: &Shutdown) -> Vec<FsEvent> {
        let mut all = Vec::new();
        for _ in 0..10 {
            match watcher.next_batch(shutdown, 50).unwrap() {
                Some(batch) if batch.is_empty() && !all.is_empty() => break,
                Some(batch) => all.extend(batch),
                None => break,
            }
        }
        all
    }

    #[test]
    fn add_dir_reports_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keys.csv");
        File::create(&file).unwrap();

        let watcher = FsWatcher::new().unwrap();
        let found = watcher.add_dir(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].added);
        assert_eq!(found[0].path, file);
        assert!(found[0].stat.is_some());
    }

    #[test]
    fn create_in_watched_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = FsWatcher::new().unwrap();
        let shutdown = Shutdown::new().unwrap();
        watcher.add_dir(dir.path()).unwrap();

        let file = dir.path().join("new.csv");
        File::create(&file).unwrap();

        let events = drain(&watcher, &shutdown);
        assert!(events
            .iter()
            .any(|e| e.path == file && e.mask.contains(EventMask::CREATE)));
    }

    #[test]
    fn modify_and_delete_of_watched_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("keys.csv");
        File::create(&file).unwrap();

        let watcher = FsWatcher::new().unwrap();
        let shutdown = Shutdown::new().unwrap();
        watcher.add(&file).unwrap();

        let mut f = File::options().append(true).open(&file).unwrap();
        writeln!(f, "30").unwrap();
        drop(f);
        let events = drain(&watcher, &shutdown);
        assert!(events
            .iter()
            .any(|e| e.path == file && e.mask.contains(EventMask::MODIFY)));

        std::fs::remove_file(&file).unwrap();
        let events = drain(&watcher, &shutdown);
        assert!(events
            .iter()
            .any(|e| e.path == file && e.mask.contains(EventMask::DELETE_SELF)));
    }

    #[test]
    fn shutdown_ends_the_wait() {
        let watcher = FsWatcher::new().unwrap();
        let shutdown = Shutdown::new().unwrap();
        shutdown.trigger();
        assert!(watcher.next_batch(&shutdown, 1000).unwrap().is_none());
    }
}
