//! Hashing for image tags and persisted volume names.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Return the first `len` characters of a hex digest (or all of it if shorter).
pub fn short(hex: &str, len: usize) -> &str {
    hex.get(..len).unwrap_or(hex)
}
