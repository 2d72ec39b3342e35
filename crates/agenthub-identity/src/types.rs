//! Record types and enumerations for the identity store.
//!
//! Every runtime mode is an exhaustive enum; no free-form strings are
//! interpreted as behavior switches.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Minimum credential / token TTL (5 minutes).
pub const MIN_TTL_SECONDS: i64 = 300;
/// Maximum credential / token TTL (30 days).
pub const MAX_TTL_SECONDS: i64 = 2_592_000;
/// Default credential / token TTL (1 day).
pub const DEFAULT_TTL_SECONDS: i64 = 86_400;
/// Maximum delegation chain depth.
pub const MAX_CHAIN_DEPTH: u32 = 5;
/// Wildcard scope: grants everything, attenuates to anything.
pub const WILDCARD_SCOPE: &str = "*";
/// Overlap window during which a rotated credential still verifies.
pub const ROTATION_GRACE_SECONDS: i64 = 300;

pub(crate) fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Render an epoch second as RFC 3339 UTC ("...Z").
pub fn iso_from_epoch(epoch: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Clamp a requested TTL into the allowed window.
pub fn clamp_ttl(ttl_seconds: i64) -> i64 {
    ttl_seconds.clamp(MIN_TTL_SECONDS, MAX_TTL_SECONDS)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    Jwt,
    Spiffe,
    Mtls,
}

impl CredentialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialType::ApiKey => "api_key",
            CredentialType::Jwt => "jwt",
            CredentialType::Spiffe => "spiffe",
            CredentialType::Mtls => "mtls",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "api_key" => Ok(CredentialType::ApiKey),
            "jwt" => Ok(CredentialType::Jwt),
            "spiffe" => Ok(CredentialType::Spiffe),
            "mtls" => Ok(CredentialType::Mtls),
            other => Err(Error::Invalid(format!("invalid credential_type: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Suspended,
    Revoked,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Active => "active",
            IdentityStatus::Suspended => "suspended",
            IdentityStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(IdentityStatus::Active),
            "suspended" => Ok(IdentityStatus::Suspended),
            "revoked" => Ok(IdentityStatus::Revoked),
            other => Err(Error::Invalid(format!("invalid identity status: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Rotated,
    Revoked,
    Expired,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Rotated => "rotated",
            CredentialStatus::Revoked => "revoked",
            CredentialStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(CredentialStatus::Active),
            "rotated" => Ok(CredentialStatus::Rotated),
            "revoked" => Ok(CredentialStatus::Revoked),
            "expired" => Ok(CredentialStatus::Expired),
            other => Err(Error::Invalid(format!("invalid credential status: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainTrustLevel {
    Verified,
    Provisional,
    Revoked,
}

impl DomainTrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainTrustLevel::Verified => "verified",
            DomainTrustLevel::Provisional => "provisional",
            DomainTrustLevel::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "verified" => Ok(DomainTrustLevel::Verified),
            "provisional" => Ok(DomainTrustLevel::Provisional),
            "revoked" => Ok(DomainTrustLevel::Revoked),
            other => Err(Error::Invalid(format!("invalid trust_level: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokedType {
    Credential,
    DelegationToken,
    AgentIdentity,
}

impl RevokedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokedType::Credential => "credential",
            RevokedType::DelegationToken => "delegation_token",
            RevokedType::AgentIdentity => "agent_identity",
        }
    }
}

/// An agent identity. Never destroyed; tombstoned via `status = revoked`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub owner: String,
    pub credential_type: CredentialType,
    pub status: IdentityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_principal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored credential. The plaintext secret is never part of this record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentCredential {
    pub credential_id: String,
    pub agent_id: String,
    pub scopes: Vec<String>,
    pub issued_at: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_parent_id: Option<String>,
    pub status: CredentialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
    #[serde(skip)]
    pub issued_at_epoch: i64,
    #[serde(skip)]
    pub expires_at_epoch: i64,
    #[serde(skip)]
    pub rotated_at_epoch: Option<i64>,
}

/// Result of issuing a credential. Carries the plaintext secret exactly once.
#[derive(Clone, Debug, Serialize)]
pub struct CredentialIssuance {
    pub credential_id: String,
    pub agent_id: String,
    pub secret: String,
    pub scopes: Vec<String>,
    pub expires_at: String,
    pub status: CredentialStatus,
}

/// Result of verifying a credential secret.
#[derive(Clone, Debug, Serialize)]
pub struct CredentialVerification {
    pub agent_id: String,
    pub credential_id: String,
    pub scopes: Vec<String>,
    pub expires_at_epoch: i64,
}

/// A stored delegation token row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelegationTokenRecord {
    pub token_id: String,
    pub issuer_agent_id: String,
    pub subject_agent_id: String,
    pub delegated_scopes: Vec<String>,
    pub issued_at_epoch: i64,
    pub expires_at_epoch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,
    pub chain_depth: u32,
    pub signature: String,
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
}

/// Result of issuing a delegation token. `signed_token` is the only bearer
/// secret: `"{token_id}.{signature_hex}"`.
#[derive(Clone, Debug, Serialize)]
pub struct IssuedDelegationToken {
    pub token_id: String,
    pub signed_token: String,
    pub issuer_agent_id: String,
    pub subject_agent_id: String,
    pub delegated_scopes: Vec<String>,
    pub issued_at: String,
    pub expires_at: String,
    pub chain_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,
}

/// Result of verifying a signed delegation token.
#[derive(Clone, Debug, Serialize)]
pub struct TokenVerification {
    pub valid: bool,
    pub token_id: String,
    pub issuer_agent_id: String,
    pub subject_agent_id: String,
    pub effective_scopes: Vec<String>,
    pub expires_at_epoch: i64,
    pub chain_depth: u32,
}

/// One hop in a delegation chain listing (root first).
#[derive(Clone, Debug, Serialize)]
pub struct ChainLink {
    pub token_id: String,
    pub issuer_agent_id: String,
    pub subject_agent_id: String,
    pub delegated_scopes: Vec<String>,
    pub chain_depth: u32,
    pub revoked: bool,
    pub expires_at: String,
}

/// Append-only audit record for a revocation.
#[derive(Clone, Debug, Serialize)]
pub struct RevocationEvent {
    pub event_id: String,
    pub revoked_type: RevokedType,
    pub revoked_id: String,
    pub agent_id: String,
    pub reason: String,
    pub actor: String,
    pub cascade_count: i64,
    pub created_at: String,
}

/// A registered federation trust domain.
#[derive(Clone, Debug, Serialize)]
pub struct TrustedDomain {
    pub domain_id: String,
    pub display_name: String,
    pub trust_level: DomainTrustLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
    pub allowed_scopes: Vec<String>,
    pub registered_by: String,
    pub created_at: String,
}

/// A signed assertion binding an agent to a trust domain.
#[derive(Clone, Debug, Serialize)]
pub struct AgentAttestation {
    pub attestation_id: String,
    pub agent_id: String,
    pub domain_id: String,
    pub claims: BTreeMap<String, String>,
    pub scopes: Vec<String>,
    pub issued_at: String,
    pub expires_at: String,
    pub signature: String,
}

/// Normalize a scope list: trimmed, deduplicated, sorted.
pub fn normalize_scopes<I, S>(scopes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut set: Vec<String> = scopes
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    set.sort();
    set.dedup();
    set
}

/// Attenuation law: requested scopes must be a subset of the parent's.
/// Returns the effective (sorted) scope set.
pub fn attenuate_scopes(parent: &[String], requested: &[String]) -> Result<Vec<String>> {
    let requested = normalize_scopes(requested.iter());
    if parent.iter().any(|s| s == WILDCARD_SCOPE) {
        return Ok(requested);
    }
    let excess: Vec<String> = requested
        .iter()
        .filter(|s| !parent.iter().any(|p| p == *s))
        .cloned()
        .collect();
    if !excess.is_empty() {
        return Err(Error::ScopeNotAttenuated { excess });
    }
    Ok(requested)
}

/// Whether a granted scope set covers a required scope.
pub fn has_scope(granted: &[String], required: &str) -> bool {
    granted.iter().any(|s| s == WILDCARD_SCOPE || s == required)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attenuation_subset_ok() {
        let parent = vec!["execute".to_string(), "read".to_string()];
        let effective = attenuate_scopes(&parent, &["read".to_string()]).unwrap();
        assert_eq!(effective, vec!["read".to_string()]);
    }

    #[test]
    fn attenuation_excess_denied() {
        let parent = vec!["read".to_string()];
        let err = attenuate_scopes(
            &parent,
            &["read".to_string(), "admin".to_string()],
        )
        .unwrap_err();
        match err {
            Error::ScopeNotAttenuated { excess } => {
                assert_eq!(excess, vec!["admin".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wildcard_parent_allows_any() {
        let parent = vec![WILDCARD_SCOPE.to_string()];
        let effective =
            attenuate_scopes(&parent, &["anything".to_string()]).unwrap();
        assert_eq!(effective, vec!["anything".to_string()]);
    }

    #[test]
    fn normalize_sorts_and_dedups() {
        let scopes = normalize_scopes(["b", " a ", "b", ""]);
        assert_eq!(scopes, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn ttl_clamped_to_window() {
        assert_eq!(clamp_ttl(10), MIN_TTL_SECONDS);
        assert_eq!(clamp_ttl(DEFAULT_TTL_SECONDS), DEFAULT_TTL_SECONDS);
        assert_eq!(clamp_ttl(i64::MAX), MAX_TTL_SECONDS);
    }

    #[test]
    fn has_scope_wildcard() {
        let granted = vec![WILDCARD_SCOPE.to_string()];
        assert!(has_scope(&granted, "delegation.create"));
        assert!(!has_scope(&["read".to_string()], "write"));
    }
}
