//! Stable content hashing for seeds, operation keys, and fingerprints.
//!
//! All hashes are SHA-256 based so they are stable across processes and
//! platforms; `DefaultHasher` is deliberately avoided.

use sha2::{Digest, Sha256};

/// Hash an ordered list of components into a short hex fingerprint
/// (first 8 bytes of SHA-256). Components are length-prefixed so that
/// `["ab","c"]` and `["a","bc"]` cannot collide.
pub fn fingerprint(parts: &[&str]) -> String {
    hex::encode(&digest(parts)[..8])
}

/// Stable 32-bit hash (SHA-256 truncation) of an ordered component list.
/// Used to seed the planner's PRNG.
pub fn stable_hash32(parts: &[&str]) -> u32 {
    let bytes = digest(parts);
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn digest(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().into()
}
