//! Channel lifecycle errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;


/// Errors returned by attaching or detaching a channel.
///
/// Errors of individual requests never show up here, they are logged where they happen.
#[derive(Debug, Error)]
pub enum Error {
    /// The mountpoint can't be passed to the OS.
    #[error("invalid mountpoint {0:?}")]
    InvalidPath(PathBuf),
    /// The volume name can't be passed to the OS as mount source.
    #[error("invalid volume name {0:?}")]
    InvalidName(String),
    /// `/dev/fuse` could not be opened.
    #[error("unable to open /dev/fuse: {0}")]
    Open(#[source] io::Error),
    /// The read pump thread could not be started.
    #[error("unable to start read pump: {0}")]
    Spawn(#[source] io::Error),
    /// The mount call failed.
    #[error("mount on {path:?} failed: {source}")]
    Mount { path: PathBuf, source: io::Error },
    /// The unmount call failed.
    #[error("unable to unmount {path:?}: {source}")]
    Unmount { path: PathBuf, source: io::Error },
    /// Closing `/dev/fuse` failed.
    #[error("unable to close /dev/fuse: {0}")]
    Close(#[source] io::Error),
}

impl Error {
    /// The OS error number behind this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::InvalidPath(_) | Error::InvalidName(_) => None,
            Error::Open(err) | Error::Spawn(err) | Error::Close(err) => err.raw_os_error(),
            Error::Mount { source, .. } | Error::Unmount { source, .. } => source.raw_os_error(),
        }
    }
}

/// Result type of channel lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
