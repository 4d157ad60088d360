//! Bounded pool of open file handles shared by all transfers
//!
//! Two jobs: enforce `max_files_open` across every transfer by closing the
//! least recently used idle handle, and make sure no two running transfers
//! write the same output path. Reservations are RAII guards; dropping a
//! [`FileReservation`] releases its paths and closes their pooled handles.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use swarm_common::InfoHash;

/// Pooled handle, shared with whoever is reading or writing it
pub type PooledFile = Arc<Mutex<File>>;

#[derive(Debug, Error)]
pub enum FilePoolError {
    #[error("file {path} belongs to another running transfer")]
    InUse { path: PathBuf },
}

struct OpenEntry {
    file: PooledFile,
    writable: bool,
}

struct PoolState {
    /// 0 = unlimited
    max_open: usize,
    owners: HashMap<PathBuf, InfoHash>,
    open: HashMap<PathBuf, OpenEntry>,
    /// Least recently used first
    lru: VecDeque<PathBuf>,
}

impl PoolState {
    fn touch(&mut self, path: &Path) {
        self.lru.retain(|p| p != path);
        self.lru.push_back(path.to_path_buf());
    }

    fn close(&mut self, path: &Path) {
        self.open.remove(path);
        self.lru.retain(|p| p != path);
    }

    /// Close idle handles until under the limit
    ///
    /// Handles still referenced outside the pool are skipped, so the pool can
    /// run over the limit while every handle is busy.
    fn evict(&mut self) {
        if self.max_open == 0 {
            return;
        }
        let mut index = 0;
        while self.open.len() > self.max_open && index < self.lru.len() {
            let path = self.lru[index].clone();
            let idle = self
                .open
                .get(&path)
                .is_some_and(|entry| Arc::strong_count(&entry.file) == 1);
            if idle {
                debug!(path = %path.display(), "closing least recently used file");
                self.close(&path);
            } else {
                index += 1;
            }
        }
    }
}

pub struct FilePool {
    state: Arc<Mutex<PoolState>>,
}

impl FilePool {
    pub fn new(max_open: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                max_open,
                owners: HashMap::new(),
                open: HashMap::new(),
                lru: VecDeque::new(),
            })),
        }
    }

    /// Claim `paths` for `owner`
    ///
    /// # Returns
    /// * `Ok(FileReservation)` - Paths are claimed until the guard drops
    /// * `Err(FilePoolError::InUse)` - A path is claimed by another transfer
    pub fn reserve(
        &self,
        owner: InfoHash,
        paths: &[PathBuf],
    ) -> Result<FileReservation, FilePoolError> {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        if let Some(path) = paths.iter().find(|p| state.owners.contains_key(*p)) {
            return Err(FilePoolError::InUse { path: path.clone() });
        }
        for path in paths {
            state.owners.insert(path.clone(), owner);
        }
        Ok(FileReservation {
            owner,
            paths: paths.to_vec(),
            state: self.state.clone(),
        })
    }

    /// Open `path` through the pool
    ///
    /// A writable request reopens a handle that was opened read-only.
    /// Writable opens create missing files.
    pub fn open(&self, path: &Path, writable: bool) -> io::Result<PooledFile> {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        let reusable = state
            .open
            .get(path)
            .filter(|entry| entry.writable || !writable)
            .map(|entry| entry.file.clone());
        if let Some(file) = reusable {
            state.touch(path);
            return Ok(file);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)?;
        let file = Arc::new(Mutex::new(file));
        state.open.insert(
            path.to_path_buf(),
            OpenEntry {
                file: file.clone(),
                writable,
            },
        );
        state.touch(path);
        state.evict();
        Ok(file)
    }

    pub fn set_max_files_open(&self, max_open: usize) {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        state.max_open = max_open;
        state.evict();
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().expect("file pool lock poisoned").open.len()
    }

    pub fn is_reserved(&self, path: &Path) -> bool {
        self.state
            .lock()
            .expect("file pool lock poisoned")
            .owners
            .contains_key(path)
    }
}

/// Claim on a transfer's output paths
pub struct FileReservation {
    owner: InfoHash,
    paths: Vec<PathBuf>,
    state: Arc<Mutex<PoolState>>,
}

impl FileReservation {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for FileReservation {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("file pool lock poisoned");
        for path in &self.paths {
            if state.owners.get(path) == Some(&self.owner) {
                state.owners.remove(path);
            }
            state.close(path);
        }
    }
}
