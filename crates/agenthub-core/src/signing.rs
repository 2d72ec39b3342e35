//! HMAC-SHA256 signing and verification
//!
//! All bearer material in AgentHub is symmetric: credential secrets are
//! stored as HMAC digests, delegation token and attestation envelopes carry
//! an HMAC signature, and policy decisions are sealed the same way. The
//! signer never panics and verification returns `false` on any mismatch,
//! including malformed hex.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Byte length of generated secrets before base64url encoding.
pub const SECRET_BYTE_LENGTH: usize = 32;

/// HMAC-SHA256 signer bound to a single secret.
///
/// # Examples
///
/// ```rust
/// use agenthub_core::HmacSigner;
///
/// let signer = HmacSigner::new(b"identity-signing-secret");
/// let sig = signer.sign(b"envelope");
/// assert_eq!(sig.len(), 64);
/// assert!(signer.verify(b"envelope", &sig));
/// ```
#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length")
    }

    /// Sign a payload; returns the lowercase hex digest.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a hex signature over a payload in constant time.
    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> bool {
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let mut mac = self.mac();
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    /// Hash a plaintext secret for storage. Same digest as [`sign`], named
    /// for the credential path where only the hash is ever persisted.
    ///
    /// [`sign`]: HmacSigner::sign
    pub fn hash_secret(&self, plaintext: &str) -> String {
        self.sign(plaintext.as_bytes())
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

/// Generate a high-entropy secret: 32 random bytes, base64url without
/// padding. Shown to the caller exactly once; only its HMAC is stored.
pub fn random_secret() -> String {
    random_secret_bytes(SECRET_BYTE_LENGTH)
}

/// Generate a secret of `n` random bytes, base64url without padding.
pub fn random_secret_bytes(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let signer = HmacSigner::new(b"secret");
        let sig = signer.sign(b"message");
        assert!(signer.verify(b"message", &sig));
    }

    #[test]
    fn test_verify_wrong_message() {
        let signer = HmacSigner::new(b"secret");
        let sig = signer.sign(b"message");
        assert!(!signer.verify(b"other", &sig));
    }

    #[test]
    fn test_verify_wrong_key() {
        let sig = HmacSigner::new(b"secret-a").sign(b"message");
        assert!(!HmacSigner::new(b"secret-b").verify(b"message", &sig));
    }

    #[test]
    fn test_verify_malformed_hex() {
        let signer = HmacSigner::new(b"secret");
        assert!(!signer.verify(b"message", "not-hex"));
        assert!(!signer.verify(b"message", ""));
    }

    #[test]
    fn test_sign_deterministic() {
        let signer = HmacSigner::new(b"secret");
        assert_eq!(signer.sign(b"m"), signer.sign(b"m"));
    }

    #[test]
    fn test_hash_secret_matches_sign() {
        let signer = HmacSigner::new(b"secret");
        assert_eq!(signer.hash_secret("tok"), signer.sign(b"tok"));
    }

    #[test]
    fn test_random_secret_unique_and_urlsafe() {
        let a = random_secret();
        let b = random_secret();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // 32 bytes -> 43 base64url chars
        assert_eq!(a.len(), 43);
    }
}
