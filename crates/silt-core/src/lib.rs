//! Silt Core
//!
//! Shared foundations for the silt log service: the ULID-prefixed record
//! model, structured error kinds, and the pluggable filesystem that every
//! segment state transition goes through.

pub mod error;
pub mod fs;
pub mod record;

pub use error::{Error, Result};
pub use fs::{FileInfo, Filesystem, FsFile, FsLock, MemFilesystem, NopFilesystem, RealFilesystem};
