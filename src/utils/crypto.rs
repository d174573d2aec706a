// Hashing utilities for CaseStrainer

use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a string as lowercase hex.
pub fn sha256_hex_str(data: &str) -> String {
    sha256_hex(data.as_bytes())
}
