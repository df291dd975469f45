//! Small shared helpers.

use sha2::{Digest, Sha256};

/// Stable 64-bit hash of a string, taken from the first eight bytes of
/// its SHA-256 digest. Used for deduplication keys and deterministic
/// experiment allocation, where stability across restarts matters and
/// `DefaultHasher` offers no such guarantee.
pub fn stable_hash64(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}
