//! Static description of a transfer's content

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::InfoHash;

/// One file inside a transfer, with its path relative to the transfer root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

/// Content description loaded from a metainfo document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    #[serde(default)]
    pub announce: String,
    pub piece_length: u64,
    /// Hex-encoded piece digests
    #[serde(default)]
    pub pieces: Vec<String>,
    pub files: Vec<FileEntry>,
    /// Multi-file layout: files live in a directory named after the transfer
    #[serde(default)]
    pub batch: bool,
}

impl Metainfo {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Total content length across all files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    /// Absolute output paths for every file, given the destination
    ///
    /// For a single-file transfer `dest` is the output file itself. For a
    /// batch transfer `dest` is the directory that receives the files.
    pub fn file_paths(&self, dest: &Path) -> Vec<PathBuf> {
        if !self.batch {
            return vec![dest.to_path_buf()];
        }
        self.files.iter().map(|file| dest.join(&file.path)).collect()
    }
}
