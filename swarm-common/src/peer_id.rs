//! Peer identifier generation
//!
//! A peer id is 20 bytes: an 8 byte client prefix followed by 12 hex
//! characters taken from a SHA-256 digest of the clock, process id and a
//! random nonce. Identifiers are regenerated whenever the listen port changes.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::CLIENT_VERSION;

/// Length of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 20;

/// Length of the client prefix at the start of every peer id
pub const CLIENT_PREFIX_LEN: usize = 8;

/// Padding used when the client prefix is shorter than [`CLIENT_PREFIX_LEN`]
const PREFIX_FILLER: u8 = b'-';

/// Client prefix for a version, e.g. `S0-1-0--` for `0.1.0`
pub fn client_prefix(version: &str) -> [u8; CLIENT_PREFIX_LEN] {
    let mut prefix = [PREFIX_FILLER; CLIENT_PREFIX_LEN];
    let tag = format!("S{}", version.replace('.', "-"));
    for (slot, byte) in prefix.iter_mut().zip(tag.bytes()) {
        *slot = byte;
    }
    prefix
}

/// Generate a fresh peer id for this client
pub fn make_peer_id() -> [u8; PEER_ID_LEN] {
    let nonce: u64 = rand::rng().random();
    make_peer_id_with(CLIENT_VERSION, SystemTime::now(), std::process::id(), nonce)
}

/// Deterministic peer id construction from explicit inputs
pub fn make_peer_id_with(
    version: &str,
    now: SystemTime,
    pid: u32,
    nonce: u64,
) -> [u8; PEER_ID_LEN] {
    let nanos = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_be_bytes());
    hasher.update(pid.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    let digest = hasher.finalize();

    let tail_len = (PEER_ID_LEN - CLIENT_PREFIX_LEN) / 2;
    let tail = hex::encode(&digest[digest.len() - tail_len..]);

    let mut id = [0u8; PEER_ID_LEN];
    id[..CLIENT_PREFIX_LEN].copy_from_slice(&client_prefix(version));
    id[CLIENT_PREFIX_LEN..].copy_from_slice(tail.as_bytes());
    id
}

/// Printable form of a peer id (ids produced here are always ASCII)
pub fn peer_id_string(id: &[u8; PEER_ID_LEN]) -> String {
    String::from_utf8_lossy(id).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_prefix_pads() {
        assert_eq!(&client_prefix("0.1.0"), b"S0-1-0--");
    }

    #[test]
    fn test_client_prefix_truncates() {
        assert_eq!(&client_prefix("10.20.30"), b"S10-20-3");
    }

    #[test]
    fn test_peer_id_layout() {
        let id = make_peer_id();
        assert_eq!(&id[..CLIENT_PREFIX_LEN], &client_prefix(CLIENT_VERSION));
        assert!(id[CLIENT_PREFIX_LEN..].iter().all(u8::is_ascii_hexdigit));
    }

    #[test]
    fn test_peer_id_deterministic_inputs() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = make_peer_id_with("0.1.0", at, 42, 7);
        let b = make_peer_id_with("0.1.0", at, 42, 7);
        let c = make_peer_id_with("0.1.0", at, 42, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&a[..CLIENT_PREFIX_LEN], &c[..CLIENT_PREFIX_LEN]);
    }

    #[test]
    fn test_peer_id_string() {
        let at = UNIX_EPOCH + Duration::from_secs(1);
        let id = make_peer_id_with("0.1.0", at, 1, 1);
        let printable = peer_id_string(&id);
        assert_eq!(printable.len(), PEER_ID_LEN);
        assert!(printable.starts_with("S0-1-0--"));
    }
}
