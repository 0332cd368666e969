//! Disk-backed filesystem using `tokio::fs`.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{FileInfo, FsFile, FsLock, Filesystem};
use crate::error::{Error, Result};

/// The production backend. Writes go through `tokio::fs`; `sync` maps to
/// fsync; `lock` uses an advisory flock that dies with the process.
#[derive(Debug, Clone, Default)]
pub struct RealFilesystem;

impl RealFilesystem {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
struct RealFile {
    path: PathBuf,
    file: File,
}

#[async_trait]
impl FsFile for RealFile {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| Error::from_io(&self.path, e))
    }

    async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        self.file
            .read_to_end(buf)
            .await
            .map_err(|e| Error::from_io(&self.path, e))
    }

    async fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::from_io(&self.path, e))
    }

    async fn size(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .await
            .map_err(|e| Error::from_io(&self.path, e))?;
        Ok(meta.len())
    }
}

#[derive(Debug)]
struct RealLock {
    _file: std::fs::File,
}

impl FsLock for RealLock {}

#[async_trait]
impl Filesystem for RealFilesystem {
    async fn create(&self, path: &Path) -> Result<Box<dyn FsFile>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        Ok(Box::new(RealFile {
            path: path.to_path_buf(),
            file,
        }))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FsFile>> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        Ok(Box::new(RealFile {
            path: path.to_path_buf(),
            file,
        }))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Error::from_io(path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| Error::from_io(from, e))
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn mtime(&self, path: &Path) -> Result<SystemTime> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::from_io(path, e))?;
        meta.modified().map_err(|e| Error::from_io(path, e))
    }

    async fn touch(&self, path: &Path) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| Error::from_io(path, e))?;
        file.set_modified(SystemTime::now())
            .map_err(|e| Error::from_io(path, e))
    }

    async fn walk(&self, root: &Path) -> Result<Vec<FileInfo>> {
        let mut entries = tokio::fs::read_dir(root)
            .await
            .map_err(|e| Error::from_io(root, e))?;
        let mut infos = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::from_io(root, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| Error::from_io(&entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }
            infos.push(FileInfo {
                path: entry.path(),
                size: meta.len(),
                mtime: meta.modified().map_err(|e| Error::from_io(&entry.path(), e))?,
            });
        }
        Ok(infos)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Error::from_io(path, e))
    }

    async fn lock(&self, path: &Path) -> Result<Box<dyn FsLock>> {
        // Startup-only, so the blocking std calls are acceptable here.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::from_io(path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| Error::Conflict(format!("{} is already locked", path.display())))?;
        Ok(Box::new(RealLock { _file: file }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFilesystem::new();
        let path = dir.path().join("a.flushed");

        let mut f = fs.create(&path).await.unwrap();
        f.write_all(b"hello\n").await.unwrap();
        f.sync().await.unwrap();
        drop(f);

        let mut f = fs.open(&path).await.unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello\n");
    }

    #[tokio::test]
    async fn test_create_fails_when_exists() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFilesystem::new();
        let path = dir.path().join("a.active");
        fs.create(&path).await.unwrap();
        let err = fs.create(&path).await.unwrap_err();
        assert!(err.is_exists());
    }

    #[tokio::test]
    async fn test_open_missing_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFilesystem::new();
        let err = fs.open(&dir.path().join("missing")).await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn test_rename_moves_and_source_gone() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFilesystem::new();
        let from = dir.path().join("x.active");
        let to = dir.path().join("x.flushed");
        fs.create(&from).await.unwrap();

        fs.rename(&from, &to).await.unwrap();
        assert!(!fs.exists(&from).await);
        assert!(fs.exists(&to).await);

        // Renaming again races against nothing and reports NotExist.
        let err = fs.rename(&from, &to).await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn test_walk_lists_only_files() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFilesystem::new();
        fs.create(&dir.path().join("one")).await.unwrap();
        fs.create_dir_all(&dir.path().join("sub")).await.unwrap();
        let infos = fs.walk(dir.path()).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].path.ends_with("one"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFilesystem::new();
        let path = dir.path().join("LOCK");
        let held = fs.lock(&path).await.unwrap();
        assert!(fs.lock(&path).await.is_err());
        drop(held);
        assert!(fs.lock(&path).await.is_ok());
    }
}
