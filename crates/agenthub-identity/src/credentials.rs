//! Credential lifecycle: issue, verify, rotate, revoke.
//!
//! The plaintext secret is returned exactly once at issuance; only its
//! HMAC-SHA256 digest is persisted. Verification is a hash lookup followed
//! by status, expiry and identity-liveness checks, in that order.

use std::sync::Arc;

use agenthub_core::{random_secret, HmacSigner};
use uuid::Uuid;

use crate::db::IdentityDb;
use crate::error::{Error, Result};
use crate::types::{
    clamp_ttl, iso_from_epoch, normalize_scopes, now_epoch, AgentCredential, CredentialIssuance,
    CredentialStatus, CredentialVerification, RevokedType, ROTATION_GRACE_SECONDS,
};

pub struct CredentialEngine {
    db: Arc<IdentityDb>,
    signer: HmacSigner,
}

impl CredentialEngine {
    pub fn new(db: Arc<IdentityDb>, signer: HmacSigner) -> Self {
        Self { db, signer }
    }

    /// Issue a credential for an active agent owned by `owner`.
    pub fn issue(
        &self,
        agent_id: &str,
        scopes: &[String],
        ttl_seconds: i64,
        owner: &str,
    ) -> Result<CredentialIssuance> {
        let identity = self.db.require_active_identity(agent_id)?;
        if identity.owner != owner {
            return Err(Error::OwnerMismatch);
        }

        let ttl = clamp_ttl(ttl_seconds);
        let now = now_epoch();
        let credential_id = format!("cred-{}", short_id());
        let secret = random_secret();
        let credential_hash = self.signer.hash_secret(&secret);
        let scopes = normalize_scopes(scopes.iter());

        self.db.insert_credential(
            &credential_id,
            agent_id,
            &credential_hash,
            &scopes,
            now,
            now + ttl,
            None,
        )?;

        Ok(CredentialIssuance {
            credential_id,
            agent_id: agent_id.to_string(),
            secret,
            scopes,
            expires_at: iso_from_epoch(now + ttl),
            status: CredentialStatus::Active,
        })
    }

    /// Verify a plaintext secret. Succeeds iff the HMAC matches a stored
    /// credential that is active (or rotated within the overlap grace), not
    /// expired, and whose parent identity is active.
    pub fn verify(&self, secret: &str) -> Result<CredentialVerification> {
        let credential_hash = self.signer.hash_secret(secret);
        let cred = self
            .db
            .find_credential_by_hash(&credential_hash)?
            .ok_or(Error::CredentialInvalid)?;

        let now = now_epoch();
        if cred.expires_at_epoch < now {
            return Err(Error::CredentialExpired);
        }
        match cred.status {
            CredentialStatus::Active => {}
            CredentialStatus::Rotated => {
                let rotated_at = cred.rotated_at_epoch.unwrap_or(0);
                if now >= rotated_at + ROTATION_GRACE_SECONDS {
                    return Err(Error::CredentialInactive(
                        CredentialStatus::Rotated.as_str().to_string(),
                    ));
                }
            }
            status => {
                return Err(Error::CredentialInactive(status.as_str().to_string()));
            }
        }

        self.db.require_active_identity(&cred.agent_id)?;

        Ok(CredentialVerification {
            agent_id: cred.agent_id,
            credential_id: cred.credential_id,
            scopes: cred.scopes,
            expires_at_epoch: cred.expires_at_epoch,
        })
    }

    /// Rotate: issue a successor referencing the predecessor, which stays
    /// verifiable for the overlap grace window and then fails.
    pub fn rotate(
        &self,
        credential_id: &str,
        owner: &str,
        new_scopes: Option<&[String]>,
        new_ttl_seconds: i64,
    ) -> Result<CredentialIssuance> {
        let old = self.db.get_credential(credential_id)?;
        if old.status != CredentialStatus::Active {
            return Err(Error::CredentialInactive(old.status.as_str().to_string()));
        }

        let identity = self.db.get_identity(&old.agent_id)?;
        if identity.owner != owner {
            return Err(Error::OwnerMismatch);
        }

        let now = now_epoch();
        self.db.mark_credential_rotated(credential_id, now)?;

        let scopes = normalize_scopes(new_scopes.unwrap_or(&old.scopes).iter());
        let ttl = clamp_ttl(new_ttl_seconds);
        let new_credential_id = format!("cred-{}", short_id());
        let secret = random_secret();
        let credential_hash = self.signer.hash_secret(&secret);

        self.db.insert_credential(
            &new_credential_id,
            &old.agent_id,
            &credential_hash,
            &scopes,
            now,
            now + ttl,
            Some(credential_id),
        )?;

        Ok(CredentialIssuance {
            credential_id: new_credential_id,
            agent_id: old.agent_id,
            secret,
            scopes,
            expires_at: iso_from_epoch(now + ttl),
            status: CredentialStatus::Active,
        })
    }

    /// Revoke a single credential and append the audit event. Idempotent:
    /// revoking an already-revoked credential returns it unchanged.
    pub fn revoke(
        &self,
        credential_id: &str,
        owner: &str,
        reason: &str,
    ) -> Result<AgentCredential> {
        let cred = self.db.get_credential(credential_id)?;
        if cred.status == CredentialStatus::Revoked {
            return Ok(cred);
        }

        let identity = self.db.get_identity(&cred.agent_id)?;
        if identity.owner != owner {
            return Err(Error::OwnerMismatch);
        }

        {
            let mut conn = self.db.lock_conn();
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            tx.execute(
                r#"UPDATE agent_credentials
                   SET status = 'revoked',
                       revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                       revocation_reason = ?1
                   WHERE credential_id = ?2"#,
                rusqlite::params![reason, credential_id],
            )?;
            tx.execute(
                r#"INSERT INTO revocation_events(
                       event_id, revoked_type, revoked_id, agent_id, reason, actor, cascade_count
                   ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)"#,
                rusqlite::params![
                    format!("rev-{}", short_id()),
                    RevokedType::Credential.as_str(),
                    credential_id,
                    cred.agent_id,
                    reason,
                    owner,
                ],
            )?;
            tx.commit()?;
        }

        self.db.get_credential(credential_id)
    }
}

pub(crate) fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::types::{CredentialType, IdentityStatus, MAX_TTL_SECONDS};

    fn setup() -> (Arc<IdentityDb>, CredentialEngine) {
        let db = Arc::new(IdentityDb::in_memory().unwrap());
        db.register_identity(
            "agt-a",
            "owner-dev",
            CredentialType::ApiKey,
            None,
            None,
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        let engine = CredentialEngine::new(db.clone(), HmacSigner::new(b"test-identity-secret"));
        (db, engine)
    }

    #[test]
    fn issue_and_verify() {
        let (_db, engine) = setup();
        let issued = engine
            .issue("agt-a", &["read".into(), "execute".into()], 3600, "owner-dev")
            .unwrap();
        assert!(issued.credential_id.starts_with("cred-"));

        let verified = engine.verify(&issued.secret).unwrap();
        assert_eq!(verified.agent_id, "agt-a");
        assert_eq!(verified.scopes, vec!["execute".to_string(), "read".to_string()]);
    }

    #[test]
    fn verify_unknown_secret_fails() {
        let (_db, engine) = setup();
        assert!(matches!(
            engine.verify("no-such-secret").unwrap_err(),
            Error::CredentialInvalid
        ));
    }

    #[test]
    fn secret_never_persisted() {
        let (db, engine) = setup();
        let issued = engine.issue("agt-a", &["read".into()], 3600, "owner-dev").unwrap();

        let cred = db.get_credential(&issued.credential_id).unwrap();
        let conn = db.lock_conn();
        let hash: String = conn
            .query_row(
                "SELECT credential_hash FROM agent_credentials WHERE credential_id = ?1",
                [&cred.credential_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_ne!(hash, issued.secret);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn owner_mismatch_rejected() {
        let (_db, engine) = setup();
        let err = engine
            .issue("agt-a", &["read".into()], 3600, "owner-partner")
            .unwrap_err();
        assert!(matches!(err, Error::OwnerMismatch));
    }

    #[test]
    fn ttl_clamped() {
        let (db, engine) = setup();
        let issued = engine
            .issue("agt-a", &["read".into()], i64::MAX, "owner-dev")
            .unwrap();
        let cred = db.get_credential(&issued.credential_id).unwrap();
        assert!(cred.expires_at_epoch - cred.issued_at_epoch <= MAX_TTL_SECONDS);
    }

    #[test]
    fn rotate_keeps_old_secret_alive_within_grace() {
        let (db, engine) = setup();
        let first = engine.issue("agt-a", &["read".into()], 3600, "owner-dev").unwrap();
        let second = engine
            .rotate(&first.credential_id, "owner-dev", None, 3600)
            .unwrap();

        assert_ne!(first.credential_id, second.credential_id);
        // Both verify during the overlap grace.
        assert!(engine.verify(&first.secret).is_ok());
        assert!(engine.verify(&second.secret).is_ok());

        let old = db.get_credential(&first.credential_id).unwrap();
        assert_eq!(old.status, CredentialStatus::Rotated);

        let new = db.get_credential(&second.credential_id).unwrap();
        assert_eq!(new.rotation_parent_id.as_deref(), Some(first.credential_id.as_str()));
    }

    #[test]
    fn rotated_secret_fails_after_grace() {
        let (db, engine) = setup();
        let first = engine.issue("agt-a", &["read".into()], 3600, "owner-dev").unwrap();
        engine.rotate(&first.credential_id, "owner-dev", None, 3600).unwrap();

        // Age the rotation past the grace window.
        {
            let conn = db.lock_conn();
            conn.execute(
                "UPDATE agent_credentials SET rotated_at_epoch = rotated_at_epoch - ?1 WHERE credential_id = ?2",
                rusqlite::params![ROTATION_GRACE_SECONDS + 1, first.credential_id],
            )
            .unwrap();
        }
        assert!(matches!(
            engine.verify(&first.secret).unwrap_err(),
            Error::CredentialInactive(_)
        ));
    }

    #[test]
    fn revoke_flips_status_and_records_event() {
        let (db, engine) = setup();
        let issued = engine.issue("agt-a", &["read".into()], 3600, "owner-dev").unwrap();
        let revoked = engine
            .revoke(&issued.credential_id, "owner-dev", "compromised")
            .unwrap();
        assert_eq!(revoked.status, CredentialStatus::Revoked);
        assert_eq!(revoked.revocation_reason.as_deref(), Some("compromised"));

        assert!(matches!(
            engine.verify(&issued.secret).unwrap_err(),
            Error::CredentialInactive(_)
        ));

        let conn = db.lock_conn();
        let events: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM revocation_events WHERE revoked_type = 'credential'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(events, 1);
    }

    #[test]
    fn expired_credential_fails_verification() {
        let (db, engine) = setup();
        let issued = engine.issue("agt-a", &["read".into()], 300, "owner-dev").unwrap();
        {
            let conn = db.lock_conn();
            conn.execute(
                "UPDATE agent_credentials SET expires_at_epoch = expires_at_epoch - 4000 WHERE credential_id = ?1",
                [&issued.credential_id],
            )
            .unwrap();
        }
        assert!(matches!(
            engine.verify(&issued.secret).unwrap_err(),
            Error::CredentialExpired
        ));
    }

    #[test]
    fn suspended_identity_blocks_verification() {
        let (db, engine) = setup();
        let issued = engine.issue("agt-a", &["read".into()], 3600, "owner-dev").unwrap();
        db.update_identity_status("agt-a", IdentityStatus::Suspended).unwrap();
        assert!(matches!(
            engine.verify(&issued.secret).unwrap_err(),
            Error::IdentityInactive { .. }
        ));
    }
}
