//! Resume files: checkpoints of verified progress
//!
//! A resume file lets a restarted transfer skip full re-verification. It
//! lives at `<data_dir>/resume/<info hash hex>` and is written atomically
//! through a temporary file and a rename.
//!
//! ## Format (big-endian)
//!
//! ```text
//! [4 bytes: "SWRM"] [1 byte: version] [4 bytes: piece count]
//! [8 bytes: verified bytes] [4 bytes: file count]
//! file count x ([8 bytes: length] [8 bytes: mtime, unix seconds])
//! [ceil(piece count / 8) bytes: piece bitmap, MSB first]
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;

use swarm_common::{Bitfield, InfoHash};

use crate::config::RESUME_DIR_NAME;

const MAGIC: &[u8; 4] = b"SWRM";
const VERSION: u8 = 1;

/// Extension of the temporary file used for atomic writes
const TEMP_EXTENSION: &str = "tmp";

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("resume data is truncated")]
    Truncated,

    #[error("not a resume file")]
    BadMagic,

    #[error("unsupported resume version {0}")]
    UnsupportedVersion(u8),

    #[error("resume bitmap does not match piece count")]
    BadBitfield,

    #[error("trailing bytes after resume data")]
    TrailingBytes,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Size and modification time of one output file when the checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub length: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    pub have: Bitfield,
    pub verified_bytes: u64,
    pub files: Vec<FileStamp>,
}

impl ResumeData {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21 + self.files.len() * 16 + self.have.as_bytes().len());
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(self.have.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.verified_bytes.to_be_bytes());
        out.extend_from_slice(&(self.files.len() as u32).to_be_bytes());
        for stamp in &self.files {
            out.extend_from_slice(&stamp.length.to_be_bytes());
            out.extend_from_slice(&stamp.mtime.to_be_bytes());
        }
        out.extend_from_slice(self.have.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ResumeError> {
        let mut reader = Reader { bytes };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(ResumeError::BadMagic);
        }
        let version = reader.take(1)?[0];
        if version != VERSION {
            return Err(ResumeError::UnsupportedVersion(version));
        }
        let piece_count = reader.u32()? as usize;
        let verified_bytes = reader.u64()?;
        let file_count = reader.u32()? as usize;

        let mut files = Vec::new();
        for _ in 0..file_count {
            let length = reader.u64()?;
            let mtime = reader.u64()? as i64;
            files.push(FileStamp { length, mtime });
        }

        let bitmap = reader.take(piece_count.div_ceil(8))?;
        let have = Bitfield::from_bytes(bitmap, piece_count).ok_or(ResumeError::BadBitfield)?;
        if !reader.bytes.is_empty() {
            return Err(ResumeError::TrailingBytes);
        }
        Ok(Self {
            have,
            verified_bytes,
            files,
        })
    }

    /// Whether the files on disk still match the checkpoint
    ///
    /// For [`BlockVerifier::verify_resume`] implementations, together with
    /// [`stamp_files`].
    ///
    /// [`BlockVerifier::verify_resume`]: crate::collaborators::BlockVerifier::verify_resume
    pub fn matches_files(&self, stamps: &[FileStamp]) -> bool {
        self.files == stamps
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ResumeError> {
        if self.bytes.len() < len {
            return Err(ResumeError::Truncated);
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, ResumeError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, ResumeError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }
}

/// Location of the resume file for `info_hash`
pub fn resume_path(data_dir: &Path, info_hash: &InfoHash) -> PathBuf {
    data_dir.join(RESUME_DIR_NAME).join(info_hash.to_hex())
}

/// Load the resume file, if any
///
/// # Returns
/// * `Ok(None)` - No resume file exists
/// * `Ok(Some(data))` - A well-formed checkpoint
/// * `Err(ResumeError)` - The file is unreadable or malformed
pub fn read_resume(data_dir: &Path, info_hash: &InfoHash) -> Result<Option<ResumeData>, ResumeError> {
    match fs::read(resume_path(data_dir, info_hash)) {
        Ok(bytes) => ResumeData::decode(&bytes).map(Some),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Write the resume file atomically
pub fn write_resume(
    data_dir: &Path,
    info_hash: &InfoHash,
    data: &ResumeData,
) -> Result<(), ResumeError> {
    let path = resume_path(data_dir, info_hash);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension(TEMP_EXTENSION);
    fs::write(&temp, data.encode())?;
    if let Err(err) = fs::rename(&temp, &path) {
        let _ = fs::remove_file(&temp);
        return Err(err.into());
    }
    Ok(())
}

/// Remove the resume file
///
/// # Returns
/// `Ok(true)` if a file was removed, `Ok(false)` if none existed
pub fn delete_resume(data_dir: &Path, info_hash: &InfoHash) -> io::Result<bool> {
    match fs::remove_file(resume_path(data_dir, info_hash)) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Current stamp of a file; a missing file stamps as empty
pub fn file_stamp(path: &Path) -> io::Result<FileStamp> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(FileStamp { length: 0, mtime: 0 });
        }
        Err(err) => return Err(err),
    };
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0);
    Ok(FileStamp {
        length: metadata.len(),
        mtime,
    })
}

/// Stamps for a storage's files, in order
///
/// Storage implementations record these in [`ResumeData::files`] and compare
/// them with [`ResumeData::matches_files`] when verifying a checkpoint.
pub fn stamp_files(paths: &[PathBuf]) -> io::Result<Vec<FileStamp>> {
    paths.iter().map(|path| file_stamp(path)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> ResumeData {
        let mut have = Bitfield::new(11);
        have.set(0);
        have.set(3);
        have.set(10);
        ResumeData {
            have,
            verified_bytes: 3 * 16384,
            files: vec![
                FileStamp {
                    length: 100_000,
                    mtime: 1_700_000_000,
                },
                FileStamp {
                    length: 80_000,
                    mtime: -5,
                },
            ],
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(bytes[4], VERSION);
        assert_eq!(&bytes[5..9], &11u32.to_be_bytes());
        assert_eq!(bytes.len(), 4 + 1 + 4 + 8 + 4 + 2 * 16 + 2);
    }

    #[test]
    fn test_decode_restores_checkpoint() {
        let data = sample();
        let decoded = ResumeData::decode(&data.encode()).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.files[1].mtime, -5);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(ResumeData::decode(&bytes), Err(ResumeError::BadMagic)));
    }

    #[test]
    fn test_decode_rejects_future_version() {
        let mut bytes = sample().encode();
        bytes[4] = 9;
        assert!(matches!(
            ResumeData::decode(&bytes),
            Err(ResumeError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation_and_trailing() {
        let bytes = sample().encode();
        assert!(matches!(
            ResumeData::decode(&bytes[..bytes.len() - 1]),
            Err(ResumeError::Truncated)
        ));

        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            ResumeData::decode(&longer),
            Err(ResumeError::TrailingBytes)
        ));
    }

    #[test]
    fn test_decode_rejects_spare_bits() {
        let mut bytes = sample().encode();
        let last = bytes.len() - 1;
        bytes[last] |= 0x01;
        assert!(matches!(
            ResumeData::decode(&bytes),
            Err(ResumeError::BadBitfield)
        ));
    }

    #[test]
    fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let hash = InfoHash::new([4; 20]);
        assert!(read_resume(dir.path(), &hash).unwrap().is_none());

        write_resume(dir.path(), &hash, &sample()).unwrap();
        assert!(resume_path(dir.path(), &hash).exists());
        assert_eq!(read_resume(dir.path(), &hash).unwrap(), Some(sample()));
        assert!(
            !resume_path(dir.path(), &hash)
                .with_extension(TEMP_EXTENSION)
                .exists()
        );

        assert!(delete_resume(dir.path(), &hash).unwrap());
        assert!(!delete_resume(dir.path(), &hash).unwrap());
    }

    #[test]
    fn test_read_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let hash = InfoHash::new([4; 20]);
        let path = resume_path(dir.path(), &hash);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"garbage").unwrap();
        assert!(read_resume(dir.path(), &hash).is_err());
    }

    #[test]
    fn test_file_stamp_missing_file() {
        let dir = TempDir::new().unwrap();
        let stamp = file_stamp(&dir.path().join("nope")).unwrap();
        assert_eq!(stamp, FileStamp { length: 0, mtime: 0 });
    }

    #[test]
    fn test_matches_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, vec![0u8; 10]).unwrap();
        let stamps = stamp_files(std::slice::from_ref(&path)).unwrap();
        assert_eq!(stamps[0].length, 10);

        let data = ResumeData {
            have: Bitfield::new(1),
            verified_bytes: 0,
            files: stamps.clone(),
        };
        assert!(data.matches_files(&stamps));
        assert!(!data.matches_files(&[]));
    }
}
