//! In-memory filesystem for tests.
//!
//! Keeps the semantics the segment lifecycle depends on: create-new fails on
//! an existing path, rename is atomic and fails with `NotExist` when the
//! source is gone, mtimes are tracked per write and preserved across rename.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use super::{FileInfo, FsFile, FsLock, Filesystem};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    mtime: SystemTime,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<PathBuf, Entry>,
    dirs: HashSet<PathBuf>,
    locks: HashSet<PathBuf>,
}

/// Shared in-memory backing. Clones see the same files.
#[derive(Debug, Clone, Default)]
pub struct MemFilesystem {
    state: Arc<Mutex<State>>,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backdate a file's mtime, for exercising age-based sweeps in tests.
    pub fn set_mtime(&self, path: &Path, mtime: SystemTime) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.files.get_mut(path) {
            Some(entry) => {
                entry.mtime = mtime;
                Ok(())
            }
            None => Err(Error::NotExist(path.to_path_buf())),
        }
    }
}

#[derive(Debug)]
struct MemFile {
    state: Arc<Mutex<State>>,
    path: PathBuf,
    read_pos: usize,
}

#[async_trait]
impl FsFile for MemFile {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.files.get_mut(&self.path) {
            Some(entry) => {
                entry.data.extend_from_slice(buf);
                entry.mtime = SystemTime::now();
                Ok(())
            }
            None => Err(Error::NotExist(self.path.clone())),
        }
    }

    async fn read_to_end(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let state = self.state.lock().unwrap();
        match state.files.get(&self.path) {
            Some(entry) => {
                let rest = &entry.data[self.read_pos.min(entry.data.len())..];
                buf.extend_from_slice(rest);
                self.read_pos = entry.data.len();
                Ok(rest.len())
            }
            None => Err(Error::NotExist(self.path.clone())),
        }
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&self.path)
            .map(|e| e.data.len() as u64)
            .ok_or_else(|| Error::NotExist(self.path.clone()))
    }
}

#[derive(Debug)]
struct MemLock {
    state: Arc<Mutex<State>>,
    path: PathBuf,
}

impl FsLock for MemLock {}

impl Drop for MemLock {
    fn drop(&mut self) {
        self.state.lock().unwrap().locks.remove(&self.path);
    }
}

#[async_trait]
impl Filesystem for MemFilesystem {
    async fn create(&self, path: &Path) -> Result<Box<dyn FsFile>> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(path) {
            return Err(Error::Exists(path.to_path_buf()));
        }
        state.files.insert(
            path.to_path_buf(),
            Entry {
                data: Vec::new(),
                mtime: SystemTime::now(),
            },
        );
        Ok(Box::new(MemFile {
            state: self.state.clone(),
            path: path.to_path_buf(),
            read_pos: 0,
        }))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FsFile>> {
        let state = self.state.lock().unwrap();
        if !state.files.contains_key(path) {
            return Err(Error::NotExist(path.to_path_buf()));
        }
        Ok(Box::new(MemFile {
            state: self.state.clone(),
            path: path.to_path_buf(),
            read_pos: 0,
        }))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotExist(path.to_path_buf()))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .files
            .remove(from)
            .ok_or_else(|| Error::NotExist(from.to_path_buf()))?;
        state.files.insert(to.to_path_buf(), entry);
        Ok(())
    }

    async fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    async fn mtime(&self, path: &Path) -> Result<SystemTime> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(path)
            .map(|e| e.mtime)
            .ok_or_else(|| Error::NotExist(path.to_path_buf()))
    }

    async fn touch(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.files.get_mut(path) {
            Some(entry) => {
                entry.mtime = SystemTime::now();
                Ok(())
            }
            None => Err(Error::NotExist(path.to_path_buf())),
        }
    }

    async fn walk(&self, root: &Path) -> Result<Vec<FileInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .files
            .iter()
            .filter(|(path, _)| path.parent() == Some(root))
            .map(|(path, entry)| FileInfo {
                path: path.clone(),
                size: entry.data.len() as u64,
                mtime: entry.mtime,
            })
            .collect())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn lock(&self, path: &Path) -> Result<Box<dyn FsLock>> {
        let mut state = self.state.lock().unwrap();
        if !state.locks.insert(path.to_path_buf()) {
            return Err(Error::Conflict(format!(
                "{} is already locked",
                path.display()
            )));
        }
        Ok(Box::new(MemLock {
            state: self.state.clone(),
            path: path.to_path_buf(),
        }))
    }
}
