//! Federation trust registry: domain registration, agent attestations.

use std::collections::BTreeMap;
use std::sync::Arc;

use agenthub_core::{canonical, HmacSigner};
use rusqlite::OptionalExtension;

use crate::credentials::short_id;
use crate::db::IdentityDb;
use crate::error::{Error, Result};
use crate::types::{
    clamp_ttl, iso_from_epoch, normalize_scopes, now_epoch, AgentAttestation, DomainTrustLevel,
    TrustedDomain,
};

pub struct FederationEngine {
    db: Arc<IdentityDb>,
    signer: HmacSigner,
}

/// Result of verifying an attestation.
#[derive(Clone, Debug, serde::Serialize)]
pub struct AttestationVerification {
    pub valid: bool,
    pub attestation_id: String,
    pub agent_id: String,
    pub domain_id: String,
    pub claims: BTreeMap<String, String>,
    pub scopes: Vec<String>,
    pub expires_at: String,
}

impl FederationEngine {
    pub fn new(db: Arc<IdentityDb>, signer: HmacSigner) -> Self {
        Self { db, signer }
    }

    pub fn register_domain(
        &self,
        domain_id: &str,
        display_name: &str,
        trust_level: DomainTrustLevel,
        public_key_pem: Option<&str>,
        allowed_scopes: &[String],
        registered_by: &str,
    ) -> Result<TrustedDomain> {
        let scopes = normalize_scopes(allowed_scopes.iter());
        let conn = self.db.lock_conn();
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO trusted_domains(
                   domain_id, display_name, trust_level, public_key_pem,
                   allowed_scopes_json, registered_by
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            rusqlite::params![
                domain_id,
                display_name,
                trust_level.as_str(),
                public_key_pem,
                serde_json::to_string(&scopes)?,
                registered_by,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!(
                "domain already registered: {domain_id}"
            )));
        }
        drop(conn);
        self.get_domain(domain_id)
    }

    pub fn get_domain(&self, domain_id: &str) -> Result<TrustedDomain> {
        let conn = self.db.lock_conn();
        conn.query_row(
            "SELECT * FROM trusted_domains WHERE domain_id = ?1",
            [domain_id],
            row_to_domain,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("trusted domain not found: {domain_id}")))
    }

    pub fn list_domains(&self) -> Result<Vec<TrustedDomain>> {
        let conn = self.db.lock_conn();
        let mut stmt =
            conn.prepare("SELECT * FROM trusted_domains ORDER BY created_at DESC, domain_id")?;
        let rows = stmt
            .query_map([], row_to_domain)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Attest an agent into a trust domain. The attested scopes must be a
    /// subset of the domain's allowed scopes.
    pub fn attest(
        &self,
        agent_id: &str,
        domain_id: &str,
        claims: &BTreeMap<String, String>,
        scopes: &[String],
        ttl_seconds: i64,
        owner: &str,
    ) -> Result<AgentAttestation> {
        let identity = self.db.require_active_identity(agent_id)?;
        if identity.owner != owner {
            return Err(Error::OwnerMismatch);
        }

        let domain = self.get_domain(domain_id)?;
        if domain.trust_level == DomainTrustLevel::Revoked {
            return Err(Error::Invalid(format!(
                "domain trust is revoked: {domain_id}"
            )));
        }

        let scopes = normalize_scopes(scopes.iter());
        let excess: Vec<String> = scopes
            .iter()
            .filter(|s| !domain.allowed_scopes.iter().any(|a| a == *s))
            .cloned()
            .collect();
        if !excess.is_empty() {
            return Err(Error::ScopeNotAttenuated { excess });
        }

        let ttl = clamp_ttl(ttl_seconds);
        let now = now_epoch();
        let attestation_id = format!("att-{}", short_id());
        let signature = self.sign_attestation(&attestation_id, agent_id, domain_id, now + ttl)?;

        let conn = self.db.lock_conn();
        conn.execute(
            r#"INSERT INTO agent_attestations(
                   attestation_id, agent_id, domain_id, claims_json, scopes_json,
                   issued_at_epoch, expires_at_epoch, signature
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            rusqlite::params![
                attestation_id,
                agent_id,
                domain_id,
                serde_json::to_string(claims)?,
                serde_json::to_string(&scopes)?,
                now,
                now + ttl,
                signature,
            ],
        )?;

        Ok(AgentAttestation {
            attestation_id,
            agent_id: agent_id.to_string(),
            domain_id: domain_id.to_string(),
            claims: claims.clone(),
            scopes,
            issued_at: iso_from_epoch(now),
            expires_at: iso_from_epoch(now + ttl),
            signature,
        })
    }

    /// Verify an attestation: signature, expiry, agent liveness, domain
    /// trust, and scope subset against the domain's current allowance.
    pub fn verify(&self, attestation_id: &str) -> Result<AttestationVerification> {
        struct Row {
            agent_id: String,
            domain_id: String,
            claims_json: String,
            scopes_json: String,
            expires_at_epoch: i64,
            signature: String,
        }

        let row = {
            let conn = self.db.lock_conn();
            conn.query_row(
                "SELECT * FROM agent_attestations WHERE attestation_id = ?1",
                [attestation_id],
                |row| {
                    Ok(Row {
                        agent_id: row.get("agent_id")?,
                        domain_id: row.get("domain_id")?,
                        claims_json: row.get("claims_json")?,
                        scopes_json: row.get("scopes_json")?,
                        expires_at_epoch: row.get("expires_at_epoch")?,
                        signature: row.get("signature")?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("attestation not found: {attestation_id}")))?
        };

        if row.expires_at_epoch < now_epoch() {
            return Err(Error::Expired);
        }

        let payload = self.attestation_payload(
            attestation_id,
            &row.agent_id,
            &row.domain_id,
            row.expires_at_epoch,
        )?;
        if !self.signer.verify(&payload, &row.signature) {
            return Err(Error::InvalidSignature);
        }

        self.db.require_active_identity(&row.agent_id)?;

        let domain = self.get_domain(&row.domain_id)?;
        if domain.trust_level == DomainTrustLevel::Revoked {
            return Err(Error::Revoked);
        }

        let scopes: Vec<String> = serde_json::from_str(&row.scopes_json)?;
        let excess: Vec<String> = scopes
            .iter()
            .filter(|s| !domain.allowed_scopes.iter().any(|a| a == *s))
            .cloned()
            .collect();
        if !excess.is_empty() {
            return Err(Error::ScopeNotAttenuated { excess });
        }

        Ok(AttestationVerification {
            valid: true,
            attestation_id: attestation_id.to_string(),
            agent_id: row.agent_id,
            domain_id: row.domain_id,
            claims: serde_json::from_str(&row.claims_json)?,
            scopes,
            expires_at: iso_from_epoch(row.expires_at_epoch),
        })
    }

    fn attestation_payload(
        &self,
        attestation_id: &str,
        agent_id: &str,
        domain_id: &str,
        expires_at_epoch: i64,
    ) -> Result<Vec<u8>> {
        let payload = serde_json::json!({
            "attestation_id": attestation_id,
            "agent_id": agent_id,
            "domain_id": domain_id,
            "expires_at": expires_at_epoch,
        });
        Ok(canonical::canonical_bytes(&payload)?)
    }

    fn sign_attestation(
        &self,
        attestation_id: &str,
        agent_id: &str,
        domain_id: &str,
        expires_at_epoch: i64,
    ) -> Result<String> {
        let payload =
            self.attestation_payload(attestation_id, agent_id, domain_id, expires_at_epoch)?;
        Ok(self.signer.sign(&payload))
    }
}

fn row_to_domain(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrustedDomain> {
    let trust_level: String = row.get("trust_level")?;
    let scopes_raw: String = row.get("allowed_scopes_json")?;
    Ok(TrustedDomain {
        domain_id: row.get("domain_id")?,
        display_name: row.get("display_name")?,
        trust_level: DomainTrustLevel::parse(&trust_level).unwrap_or(DomainTrustLevel::Revoked),
        public_key_pem: row.get("public_key_pem")?,
        allowed_scopes: serde_json::from_str(&scopes_raw).unwrap_or_default(),
        registered_by: row.get("registered_by")?,
        created_at: row.get("created_at")?,
    })
}
