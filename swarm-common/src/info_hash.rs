//! Content identifier shared by every peer in a swarm

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of an info hash in bytes
pub const INFO_HASH_LEN: usize = 20;

/// 20-byte digest identifying a transfer's content
///
/// Serialized as a 40 character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InfoHash([u8; INFO_HASH_LEN]);

/// Errors from parsing an info hash
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfoHashError {
    #[error("info hash must be {INFO_HASH_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("info hash is not valid hex")]
    InvalidHex,
}

impl InfoHash {
    pub const fn new(bytes: [u8; INFO_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a byte slice, returning `None` unless it is exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; INFO_HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; INFO_HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, InfoHashError> {
        let bytes = hex::decode(s).map_err(|_| InfoHashError::InvalidHex)?;
        Self::from_slice(&bytes).ok_or(InfoHashError::InvalidLength(bytes.len()))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl FromStr for InfoHash {
    type Err = InfoHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for InfoHash {
    type Error = InfoHashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<InfoHash> for String {
    fn from(hash: InfoHash) -> Self {
        hash.to_hex()
    }
}
