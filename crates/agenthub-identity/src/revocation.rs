//! Revocation engine: single-target and cascading revocation.
//!
//! The kill switch runs as one write transaction: identity tombstone,
//! credential sweep, token sweep (issuer OR subject) and the audit event
//! land together, so a concurrent verify sees the entire cascade or none
//! of it.

use std::sync::Arc;

use crate::credentials::short_id;
use crate::db::IdentityDb;
use crate::error::{Error, Result};
use crate::types::{IdentityStatus, RevocationEvent, RevokedType};

pub struct RevocationEngine {
    db: Arc<IdentityDb>,
}

/// Outcome of a kill-switch invocation.
#[derive(Clone, Debug, serde::Serialize)]
pub struct AgentRevocation {
    pub event_id: String,
    pub agent_id: String,
    pub revoked_credentials: i64,
    pub revoked_tokens: i64,
    pub cancelled_leases: i64,
    pub cascade_count: i64,
    pub reason: String,
}

impl RevocationEngine {
    pub fn new(db: Arc<IdentityDb>) -> Self {
        Self { db }
    }

    /// Kill switch. `extra_cascade` counts lifecycle rows the caller flagged
    /// for cancellation (they live in the hub store and transition to
    /// `cancelled` on next touch).
    pub fn revoke_agent(
        &self,
        agent_id: &str,
        owner: &str,
        reason: &str,
        extra_cascade: i64,
    ) -> Result<AgentRevocation> {
        let identity = self.db.get_identity(agent_id)?;
        if identity.owner != owner {
            return Err(Error::OwnerMismatch);
        }

        let event_id = format!("rev-{}", short_id());
        let mut conn = self.db.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        tx.execute(
            r#"UPDATE agent_identities
               SET status = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
               WHERE agent_id = ?2"#,
            rusqlite::params![IdentityStatus::Revoked.as_str(), agent_id],
        )?;

        let revoked_credentials = tx.execute(
            r#"UPDATE agent_credentials
               SET status = 'revoked',
                   revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now'),
                   revocation_reason = ?1
               WHERE agent_id = ?2 AND status = 'active'"#,
            rusqlite::params![reason, agent_id],
        )? as i64;

        // Tokens the agent issued or holds, plus every descendant grant
        // derived from them: no in-flight grant outlives the revoke.
        let revoked_tokens = tx.execute(
            r#"WITH RECURSIVE swept(token_id) AS (
                   SELECT token_id FROM delegation_tokens
                   WHERE issuer_agent_id = ?1 OR subject_agent_id = ?1
                   UNION
                   SELECT t.token_id FROM delegation_tokens t
                   JOIN swept s ON t.parent_token_id = s.token_id
               )
               UPDATE delegation_tokens
               SET revoked = 1, revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
               WHERE token_id IN (SELECT token_id FROM swept) AND revoked = 0"#,
            [agent_id],
        )? as i64;

        let cascade_count = revoked_credentials + revoked_tokens + extra_cascade;
        tx.execute(
            r#"INSERT INTO revocation_events(
                   event_id, revoked_type, revoked_id, agent_id, reason, actor, cascade_count
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            rusqlite::params![
                event_id,
                RevokedType::AgentIdentity.as_str(),
                agent_id,
                agent_id,
                reason,
                owner,
                cascade_count,
            ],
        )?;

        tx.commit()?;

        tracing::info!(
            agent_id,
            revoked_credentials,
            revoked_tokens,
            cancelled_leases = extra_cascade,
            "agent revoked"
        );

        Ok(AgentRevocation {
            event_id,
            agent_id: agent_id.to_string(),
            revoked_credentials,
            revoked_tokens,
            cancelled_leases: extra_cascade,
            cascade_count,
            reason: reason.to_string(),
        })
    }

    /// Bulk kill switch: the same machine applied per agent. Failures are
    /// reported per entry rather than aborting the batch.
    pub fn bulk_revoke(
        &self,
        agent_ids: &[String],
        owner: &str,
        reason: &str,
    ) -> Vec<std::result::Result<AgentRevocation, (String, Error)>> {
        agent_ids
            .iter()
            .map(|agent_id| {
                self.revoke_agent(agent_id, owner, reason, 0)
                    .map_err(|e| (agent_id.clone(), e))
            })
            .collect()
    }

    /// List revocation events, newest first, optionally filtered by agent.
    pub fn list_events(&self, agent_id: Option<&str>, limit: i64) -> Result<Vec<RevocationEvent>> {
        let conn = self.db.lock_conn();
        let mut out = Vec::new();
        let mut push = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
            let revoked_type: String = row.get("revoked_type")?;
            out.push(RevocationEvent {
                event_id: row.get("event_id")?,
                revoked_type: match revoked_type.as_str() {
                    "credential" => RevokedType::Credential,
                    "delegation_token" => RevokedType::DelegationToken,
                    _ => RevokedType::AgentIdentity,
                },
                revoked_id: row.get("revoked_id")?,
                agent_id: row.get("agent_id")?,
                reason: row.get("reason")?,
                actor: row.get("actor")?,
                cascade_count: row.get("cascade_count")?,
                created_at: row.get("created_at")?,
            });
            Ok(())
        };

        match agent_id {
            Some(agent) => {
                let mut stmt = conn.prepare(
                    r#"SELECT * FROM revocation_events
                       WHERE agent_id = ?1 ORDER BY created_at DESC, event_id LIMIT ?2"#,
                )?;
                let mut rows = stmt.query(rusqlite::params![agent, limit])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM revocation_events ORDER BY created_at DESC, event_id LIMIT ?1",
                )?;
                let mut rows = stmt.query([limit])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use agenthub_core::HmacSigner;

    use super::*;
    use crate::credentials::CredentialEngine;
    use crate::tokens::{IssueTokenRequest, TokenEngine};
    use crate::types::CredentialType;

    struct Fixture {
        db: Arc<IdentityDb>,
        creds: CredentialEngine,
        tokens: TokenEngine,
        revocation: RevocationEngine,
    }

    fn setup() -> Fixture {
        let db = Arc::new(IdentityDb::in_memory().unwrap());
        let signer = HmacSigner::new(b"test-identity-secret");
        for agent in ["agt-x", "agt-y", "agt-z"] {
            db.register_identity(
                agent,
                "owner-dev",
                CredentialType::ApiKey,
                None,
                None,
                None,
                &BTreeMap::new(),
            )
            .unwrap();
        }
        Fixture {
            creds: CredentialEngine::new(db.clone(), signer.clone()),
            tokens: TokenEngine::new(db.clone(), signer),
            revocation: RevocationEngine::new(db.clone()),
            db,
        }
    }

    #[test]
    fn kill_switch_cascades_credentials_and_tokens() {
        let f = setup();
        let cx = f
            .creds
            .issue("agt-x", &["read".into(), "execute".into()], 3600, "owner-dev")
            .unwrap();
        let tx1 = f
            .tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-x".into(),
                    subject_agent_id: "agt-y".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 3600,
                    parent_token_id: None,
                },
                "owner-dev",
            )
            .unwrap();
        let tx2 = f
            .tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-y".into(),
                    subject_agent_id: "agt-z".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 600,
                    parent_token_id: Some(tx1.token_id.clone()),
                },
                "owner-dev",
            )
            .unwrap();

        let outcome = f
            .revocation
            .revoke_agent("agt-x", "owner-dev", "security_incident", 0)
            .unwrap();
        assert_eq!(outcome.revoked_credentials, 1);
        // tx1 (issuer = x) is swept directly; tx2 as its descendant.
        assert_eq!(outcome.revoked_tokens, 2);
        assert!(outcome.cascade_count >= 3);

        assert!(f.creds.verify(&cx.secret).is_err());
        assert!(f.tokens.verify(&tx1.signed_token).is_err());
        assert!(f.tokens.verify(&tx2.signed_token).is_err());
    }

    #[test]
    fn cascade_is_atomic() {
        let f = setup();
        f.creds.issue("agt-x", &["read".into()], 3600, "owner-dev").unwrap();
        f.revocation
            .revoke_agent("agt-x", "owner-dev", "security_incident", 0)
            .unwrap();

        // Identity tombstone and credential sweep landed together.
        let conn = f.db.lock_conn();
        let status: String = conn
            .query_row(
                "SELECT status FROM agent_identities WHERE agent_id = 'agt-x'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "revoked");
        let live: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM agent_credentials WHERE agent_id = 'agt-x' AND status = 'active'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(live, 0);
    }

    #[test]
    fn owner_mismatch_rejected() {
        let f = setup();
        let err = f
            .revocation
            .revoke_agent("agt-x", "owner-partner", "nope", 0)
            .unwrap_err();
        assert!(matches!(err, Error::OwnerMismatch));
    }

    #[test]
    fn bulk_revoke_reports_per_agent() {
        let f = setup();
        let results = f.revocation.bulk_revoke(
            &["agt-x".into(), "missing".into()],
            "owner-dev",
            "incident",
        );
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn events_listed_newest_first() {
        let f = setup();
        f.revocation
            .revoke_agent("agt-x", "owner-dev", "first", 0)
            .unwrap();
        f.revocation
            .revoke_agent("agt-y", "owner-dev", "second", 0)
            .unwrap();

        let events = f.revocation.list_events(None, 10).unwrap();
        assert_eq!(events.len(), 2);

        let filtered = f.revocation.list_events(Some("agt-x"), 10).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].reason, "first");
    }
}
