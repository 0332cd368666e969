//! Error Types for Silt
//!
//! This module defines the error type shared by all silt crates.
//!
//! ## Error Categories
//!
//! ### Filesystem Errors
//! - `NotExist`: The path does not exist (also the signal for a lost claim race)
//! - `Exists`: The path already exists
//! - `Denied`: Permission or lock denied
//! - `Conflict`: The resource is busy, e.g. the directory's advisory lock
//!   is held by another process
//!
//! ### Data Errors
//! - `MalformedRecord`: A record is missing its ULID prefix or newline framing
//!
//! ### Everything Else
//! - `Io`: Any other I/O failure, carried verbatim
//!
//! ## Usage
//! All silt-core functions return `Result<T>` which is aliased to
//! `Result<T, Error>`, so `?` propagation works throughout.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("does not exist: {0}")]
    NotExist(PathBuf),

    #[error("already exists: {0}")]
    Exists(PathBuf),

    #[error("access denied: {0}")]
    Denied(PathBuf),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map an `std::io::Error` onto the structured kinds, keeping the path.
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotExist(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => Error::Exists(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Error::Denied(path.to_path_buf()),
            _ => Error::Io(err),
        }
    }

    /// True when the error means the source path vanished, which is how a
    /// lost rename race surfaces.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::NotExist(_))
    }

    pub fn is_exists(&self) -> bool {
        matches!(self, Error::Exists(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::from_io(Path::new("/tmp/x"), io);
        assert!(err.is_not_exist());
    }

    #[test]
    fn test_from_io_already_exists() {
        let io = std::io::Error::new(std::io::ErrorKind::AlreadyExists, "there");
        let err = Error::from_io(Path::new("/tmp/x"), io);
        assert!(err.is_exists());
    }

    #[test]
    fn test_from_io_other_kinds_stay_io() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = Error::from_io(Path::new("/tmp/x"), io);
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_display_includes_path() {
        let err = Error::NotExist(PathBuf::from("/data/seg.flushed"));
        assert!(err.to_string().contains("/data/seg.flushed"));
    }
}
