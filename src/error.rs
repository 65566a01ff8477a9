//! Error types for the keyboard daemon

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from a grabbed keyboard device
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to open input device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("exclusive grab failed: {0}")]
    Grab(io::Error),

    #[error("device read failed: {0}")]
    Read(io::Error),
}

/// Errors on the framed socket to the macro daemon
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("macro daemon is not connected")]
    NotConnected,

    #[error("macro daemon hung up")]
    Disconnected,

    #[error("macro daemon response deadline exceeded")]
    Timeout,

    #[error("malformed action record: {0}")]
    Decode(&'static str),

    #[error("socket i/o failed: {0}")]
    Io(io::Error),
}

/// Errors while (re)loading a passthrough CSV
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("cannot resolve {path}: {source}")]
    Path { path: PathBuf, source: io::Error },

    #[error("rejected {path}: mode {mode:o} owner uid {uid} (want 0644 owned by uid {want_uid})")]
    Perm {
        path: PathBuf,
        mode: u32,
        uid: u32,
        want_uid: u32,
    },

    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("csv parse failed: {0}")]
    Parse(#[from] csv::Error),

    #[error("no key_code column in {0}")]
    MissingColumn(PathBuf),
}

/// Errors from the filesystem watcher
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("inotify init failed: {0}")]
    Init(io::Error),

    #[error("failed to watch {path}: {source}")]
    Add { path: PathBuf, source: io::Error },

    #[error("watch read failed: {0}")]
    Read(io::Error),
}

/// Fatal conditions that terminate the run loop
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("macro daemon unreachable after {errors} consecutive socket failures")]
    MacroDaemonLost { errors: u32 },

    #[error("virtual keyboard write failed: {0}")]
    Emit(io::Error),

    #[error("device multiplexer failed: {0}")]
    Poll(io::Error),
}
