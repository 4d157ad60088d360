//! Swarm Common Library
//!
//! Shared types and identifiers for the swarm transfer daemon.

mod bitfield;
mod error_level;
mod info_hash;
pub mod metainfo;
pub mod peer_id;

pub use bitfield::Bitfield;
pub use error_level::ErrorLevel;
pub use info_hash::{INFO_HASH_LEN, InfoHash, InfoHashError};
pub use metainfo::{FileEntry, Metainfo};

/// Client version embedded in generated peer identifiers
pub const CLIENT_VERSION: &str = "0.1.0";

/// Lowest port tried when binding the shared peer listener
pub const DEFAULT_MIN_PORT: u16 = 6881;

/// Highest port tried when binding the shared peer listener
pub const DEFAULT_MAX_PORT: u16 = 6999;

/// Protocol name carried in every peer handshake
pub const PROTOCOL_NAME: &[u8] = b"BitTorrent protocol";

/// Bytes of a peer handshake needed to route the connection to a transfer.
///
/// Layout: 1 byte name length, 19 byte protocol name, 8 reserved bytes,
/// 20 byte info hash.
pub const HANDSHAKE_PREFIX_LEN: usize = 1 + 19 + 8 + INFO_HASH_LEN;
