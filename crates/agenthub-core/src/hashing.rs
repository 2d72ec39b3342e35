//! SHA-256 hashing

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of data.
///
/// # Examples
///
/// ```rust
/// use agenthub_core::sha256;
///
/// let hash = sha256(b"hello");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    bytes
}

/// Compute SHA-256 hash and return as hex string (no prefix).
///
/// # Examples
///
/// ```rust
/// use agenthub_core::sha256_hex;
///
/// // Known test vector
/// assert_eq!(
///     sha256_hex(b"hello"),
///     "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
/// );
/// ```
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_sha256_deterministic() {
        assert_eq!(sha256(b"payload"), sha256(b"payload"));
        assert_ne!(sha256(b"payload"), sha256(b"payload2"));
    }
}
