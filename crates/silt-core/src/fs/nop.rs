//! Discarding filesystem, for measuring the pipeline without a disk.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;

use super::{FileInfo, FsFile, FsLock, Filesystem};
use crate::error::{Error, Result};

/// Accepts every write and forgets it. Reads find nothing.
#[derive(Debug, Clone, Default)]
pub struct NopFilesystem;

impl NopFilesystem {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct NopFile {
    written: u64,
}

#[async_trait]
impl FsFile for NopFile {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.written += buf.len() as u64;
        Ok(())
    }

    async fn read_to_end(&mut self, _buf: &mut Vec<u8>) -> Result<usize> {
        Ok(0)
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.written)
    }
}

#[derive(Debug)]
struct NopLock;

impl FsLock for NopLock {}

#[async_trait]
impl Filesystem for NopFilesystem {
    async fn create(&self, _path: &Path) -> Result<Box<dyn FsFile>> {
        Ok(Box::new(NopFile { written: 0 }))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FsFile>> {
        Err(Error::NotExist(path.to_path_buf()))
    }

    async fn remove(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _path: &Path) -> bool {
        false
    }

    async fn mtime(&self, path: &Path) -> Result<SystemTime> {
        Err(Error::NotExist(path.to_path_buf()))
    }

    async fn touch(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn walk(&self, _root: &Path) -> Result<Vec<FileInfo>> {
        Ok(Vec::new())
    }

    async fn create_dir_all(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn lock(&self, _path: &Path) -> Result<Box<dyn FsLock>> {
        Ok(Box::new(NopLock))
    }
}
