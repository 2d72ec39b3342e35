#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! # agenthub-core
//!
//! Cryptographic primitives for the AgentHub identity, delegation and
//! authorization core.
//!
//! This crate provides:
//! - HMAC-SHA256 signing and constant-time verification
//! - Canonical JSON (sorted keys, compact separators)
//! - SHA-256 hashing
//! - High-entropy secret generation
//!
//! ## Quick Start
//!
//! ```rust
//! use agenthub_core::{HmacSigner, random_secret, sha256_hex};
//!
//! let signer = HmacSigner::new(b"signing-secret");
//! let sig = signer.sign(b"payload");
//! assert!(signer.verify(b"payload", &sig));
//! assert!(!signer.verify(b"tampered", &sig));
//!
//! // Hash some data
//! assert_eq!(sha256_hex(b"hello").len(), 64);
//!
//! // Generate a bearer secret (base64url, no padding)
//! let secret = random_secret();
//! assert!(secret.len() >= 40);
//! ```

pub mod canonical;
pub mod error;
pub mod hashing;
pub mod signing;

pub use canonical::canonicalize;
pub use error::{Error, Result};
pub use hashing::{sha256, sha256_hex};
pub use signing::{random_secret, HmacSigner, SECRET_BYTE_LENGTH};
