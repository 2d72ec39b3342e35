#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Identity, delegation and revocation primitives for AgentHub.
//!
//! This crate implements the durable half of the control plane:
//! - Agent identities and their lifecycle (active / suspended / revoked)
//! - Hashed credentials with rotation lineage
//! - Scope-attenuated delegation tokens chained up to five hops
//! - Single-target and cascading ("kill switch") revocation
//! - The federation trust registry and signed agent attestations
//!
//! Everything persists to one SQLite database ([`IdentityDb`]); multi-row
//! mutations (the revocation cascade, token cascades) run inside a single
//! write transaction so a concurrent verify sees all of a cascade or none
//! of it.

mod credentials;
mod db;
mod error;
mod federation;
mod revocation;
mod tokens;
mod types;

pub use credentials::CredentialEngine;
pub use db::IdentityDb;
pub use error::{Error, Result};
pub use federation::{AttestationVerification, FederationEngine};
pub use revocation::{AgentRevocation, RevocationEngine};
pub use tokens::{IssueTokenRequest, TokenEngine};
pub use types::{
    attenuate_scopes, clamp_ttl, has_scope, iso_from_epoch, normalize_scopes, AgentAttestation,
    AgentCredential, AgentIdentity, ChainLink, CredentialIssuance, CredentialStatus,
    CredentialType, CredentialVerification, DelegationTokenRecord, DomainTrustLevel,
    IdentityStatus, IssuedDelegationToken, RevocationEvent, RevokedType, TokenVerification,
    DEFAULT_TTL_SECONDS, MAX_CHAIN_DEPTH, MAX_TTL_SECONDS, MIN_TTL_SECONDS, WILDCARD_SCOPE,
};
