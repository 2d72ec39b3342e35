//! Delegation token engine: issue, verify, decode, chain, attenuate.
//!
//! Tokens are scope-attenuated bearer grants along a parent chain of at most
//! five hops. The signature covers the canonical envelope
//! `{token_id, issuer, subject, scopes, issued_at, expires_at,
//! parent_token_id, chain_depth}`; the bearer form is
//! `"{token_id}.{signature_hex}"`.

use std::collections::BTreeSet;
use std::sync::Arc;

use agenthub_core::{canonical, HmacSigner};

use crate::credentials::short_id;
use crate::db::IdentityDb;
use crate::error::{Error, Result};
use crate::types::{
    attenuate_scopes, clamp_ttl, iso_from_epoch, normalize_scopes, now_epoch, ChainLink,
    DelegationTokenRecord, IssuedDelegationToken, TokenVerification, MAX_CHAIN_DEPTH,
    WILDCARD_SCOPE,
};

pub struct TokenEngine {
    db: Arc<IdentityDb>,
    signer: HmacSigner,
}

/// Parameters for issuing a delegation token.
#[derive(Clone, Debug)]
pub struct IssueTokenRequest {
    pub issuer_agent_id: String,
    pub subject_agent_id: String,
    pub delegated_scopes: Vec<String>,
    pub ttl_seconds: i64,
    pub parent_token_id: Option<String>,
}

impl TokenEngine {
    pub fn new(db: Arc<IdentityDb>, signer: HmacSigner) -> Self {
        Self { db, signer }
    }

    /// Issue a delegation token. Root tokens attenuate against the union of
    /// the issuer's active credential scopes; chained tokens attenuate
    /// against their parent and may only be minted by the parent's holder.
    pub fn issue(&self, req: &IssueTokenRequest, owner: &str) -> Result<IssuedDelegationToken> {
        let issuer = self.db.require_active_identity(&req.issuer_agent_id)?;
        if issuer.owner != owner {
            return Err(Error::OwnerMismatch);
        }
        self.db.require_active_identity(&req.subject_agent_id)?;

        let now = now_epoch();
        let (chain_depth, effective_scopes, parent_expires) = match &req.parent_token_id {
            Some(parent_id) => {
                let parent = self
                    .db
                    .get_token(parent_id)?
                    .ok_or_else(|| Error::NotFound(format!("parent token not found: {parent_id}")))?;
                if parent.revoked {
                    return Err(Error::Revoked);
                }
                if parent.expires_at_epoch <= now {
                    return Err(Error::Expired);
                }
                // Only the holder of the parent grant may re-delegate it.
                if parent.subject_agent_id != req.issuer_agent_id {
                    return Err(Error::OwnerMismatch);
                }
                let depth = parent.chain_depth + 1;
                if depth > MAX_CHAIN_DEPTH {
                    return Err(Error::ChainTooDeep {
                        depth,
                        max: MAX_CHAIN_DEPTH,
                    });
                }
                let scopes = attenuate_scopes(&parent.delegated_scopes, &req.delegated_scopes)?;
                (depth, scopes, Some(parent.expires_at_epoch))
            }
            None => {
                let creds = self.db.list_active_credentials(&req.issuer_agent_id)?;
                if creds.is_empty() {
                    return Err(Error::NoActiveCredentials);
                }
                let granted: Vec<String> = normalize_scopes(
                    creds.iter().flat_map(|c| c.scopes.iter().cloned()),
                );
                let scopes = attenuate_scopes(&granted, &req.delegated_scopes)?;
                (0, scopes, None)
            }
        };

        let ttl = clamp_ttl(req.ttl_seconds);
        let expires_at_epoch = match parent_expires {
            Some(parent_exp) => (now + ttl).min(parent_exp),
            None => now + ttl,
        };

        let token_id = format!("dtk-{}", short_id());
        let mut rec = DelegationTokenRecord {
            token_id: token_id.clone(),
            issuer_agent_id: req.issuer_agent_id.clone(),
            subject_agent_id: req.subject_agent_id.clone(),
            delegated_scopes: effective_scopes,
            issued_at_epoch: now,
            expires_at_epoch,
            parent_token_id: req.parent_token_id.clone(),
            chain_depth,
            signature: String::new(),
            revoked: false,
            revoked_at: None,
        };
        rec.signature = self.sign_envelope(&rec)?;
        self.db.insert_token(&rec)?;

        Ok(IssuedDelegationToken {
            signed_token: format!("{token_id}.{}", rec.signature),
            token_id,
            issuer_agent_id: rec.issuer_agent_id,
            subject_agent_id: rec.subject_agent_id,
            delegated_scopes: rec.delegated_scopes,
            issued_at: iso_from_epoch(rec.issued_at_epoch),
            expires_at: iso_from_epoch(rec.expires_at_epoch),
            chain_depth,
            parent_token_id: rec.parent_token_id,
        })
    }

    /// Verify a signed token and the integrity of its full ancestor chain.
    /// Returns the effective scopes: the intersection of delegated scopes
    /// over every hop. Failures name the offending hop (0 = the token
    /// itself, 1 = its parent, ...).
    pub fn verify(&self, signed_token: &str) -> Result<TokenVerification> {
        let (token_id, signature) = signed_token
            .split_once('.')
            .ok_or(Error::InvalidSignature)?;

        let rec = self
            .db
            .get_token(token_id)?
            .ok_or(Error::CredentialInvalid)?;

        let envelope = self.envelope_bytes(&rec)?;
        if !self.signer.verify(&envelope, signature) {
            return Err(Error::InvalidSignature);
        }

        let now = now_epoch();
        if rec.revoked {
            return Err(Error::Revoked);
        }
        if rec.expires_at_epoch <= now {
            return Err(Error::Expired);
        }
        self.db
            .require_active_identity(&rec.issuer_agent_id)
            .map_err(|_| Error::ChainInvalid {
                hop: 0,
                reason: "issuer identity is not active".to_string(),
            })?;

        // Walk to the root. The depth bound doubles as a cycle fail-safe.
        let mut effective = scope_set(&rec.delegated_scopes);
        let mut current = rec.clone();
        let mut hop: u32 = 0;
        while let Some(parent_id) = current.parent_token_id.clone() {
            hop += 1;
            if hop > MAX_CHAIN_DEPTH {
                return Err(Error::ChainInvalid {
                    hop,
                    reason: "chain too deep".to_string(),
                });
            }
            let parent = self
                .db
                .get_token(&parent_id)?
                .ok_or_else(|| Error::ChainInvalid {
                    hop,
                    reason: "parent token missing".to_string(),
                })?;
            if parent.revoked {
                return Err(Error::ChainInvalid {
                    hop,
                    reason: "parent token revoked".to_string(),
                });
            }
            if parent.expires_at_epoch <= now {
                return Err(Error::ChainInvalid {
                    hop,
                    reason: "parent token expired".to_string(),
                });
            }
            if !covers(&parent.delegated_scopes, &current.delegated_scopes) {
                return Err(Error::ChainInvalid {
                    hop,
                    reason: "parent scopes do not cover child scopes".to_string(),
                });
            }
            if self.db.require_active_identity(&parent.issuer_agent_id).is_err() {
                return Err(Error::ChainInvalid {
                    hop,
                    reason: "issuer identity is not active".to_string(),
                });
            }
            effective = intersect(&effective, &parent.delegated_scopes);
            current = parent;
        }

        Ok(TokenVerification {
            valid: true,
            token_id: rec.token_id,
            issuer_agent_id: rec.issuer_agent_id,
            subject_agent_id: rec.subject_agent_id,
            effective_scopes: effective.into_iter().collect(),
            expires_at_epoch: rec.expires_at_epoch,
            chain_depth: rec.chain_depth,
        })
    }

    /// List a token and all its ancestors, root first.
    pub fn chain(&self, token_id: &str) -> Result<Vec<ChainLink>> {
        let rec = self
            .db
            .get_token(token_id)?
            .ok_or_else(|| Error::NotFound(format!("delegation token not found: {token_id}")))?;

        let mut links = Vec::new();
        let mut current = Some(rec);
        let mut hops: u32 = 0;
        while let Some(rec) = current {
            links.push(ChainLink {
                token_id: rec.token_id.clone(),
                issuer_agent_id: rec.issuer_agent_id.clone(),
                subject_agent_id: rec.subject_agent_id.clone(),
                delegated_scopes: rec.delegated_scopes.clone(),
                chain_depth: rec.chain_depth,
                revoked: rec.revoked,
                expires_at: iso_from_epoch(rec.expires_at_epoch),
            });
            hops += 1;
            if hops > MAX_CHAIN_DEPTH {
                break;
            }
            current = match &rec.parent_token_id {
                Some(parent_id) => self.db.get_token(parent_id)?,
                None => None,
            };
        }
        links.reverse();
        Ok(links)
    }

    /// Revoke a single token and cascade to all descendants, in one
    /// transaction. Returns the number of descendant tokens swept.
    pub fn revoke(&self, token_id: &str, owner: &str) -> Result<i64> {
        let rec = self
            .db
            .get_token(token_id)?
            .ok_or_else(|| Error::NotFound(format!("delegation token not found: {token_id}")))?;

        let issuer = self.db.get_identity(&rec.issuer_agent_id)?;
        if issuer.owner != owner {
            return Err(Error::OwnerMismatch);
        }

        let mut conn = self.db.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute(
            r#"UPDATE delegation_tokens
               SET revoked = 1, revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
               WHERE token_id = ?1"#,
            [token_id],
        )?;

        // Recursive CTE sweeps every descendant in the same statement.
        let cascade = tx.execute(
            r#"WITH RECURSIVE descendants(token_id) AS (
                   SELECT token_id FROM delegation_tokens WHERE parent_token_id = ?1
                   UNION ALL
                   SELECT t.token_id FROM delegation_tokens t
                   JOIN descendants d ON t.parent_token_id = d.token_id
               )
               UPDATE delegation_tokens
               SET revoked = 1, revoked_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
               WHERE token_id IN (SELECT token_id FROM descendants) AND revoked = 0"#,
            [token_id],
        )?;

        tx.execute(
            r#"INSERT INTO revocation_events(
                   event_id, revoked_type, revoked_id, agent_id, reason, actor, cascade_count
               ) VALUES (?1, 'delegation_token', ?2, ?3, 'manual_revocation', ?4, ?5)"#,
            rusqlite::params![
                format!("rev-{}", short_id()),
                token_id,
                rec.issuer_agent_id,
                owner,
                1 + cascade as i64,
            ],
        )?;
        tx.commit()?;

        Ok(cascade as i64)
    }

    fn envelope_bytes(&self, rec: &DelegationTokenRecord) -> Result<Vec<u8>> {
        let envelope = serde_json::json!({
            "token_id": rec.token_id,
            "issuer": rec.issuer_agent_id,
            "subject": rec.subject_agent_id,
            "scopes": rec.delegated_scopes,
            "issued_at": rec.issued_at_epoch,
            "expires_at": rec.expires_at_epoch,
            "parent_token_id": rec.parent_token_id,
            "chain_depth": rec.chain_depth,
        });
        Ok(canonical::canonical_bytes(&envelope)?)
    }

    fn sign_envelope(&self, rec: &DelegationTokenRecord) -> Result<String> {
        Ok(self.signer.sign(&self.envelope_bytes(rec)?))
    }
}

fn scope_set(scopes: &[String]) -> BTreeSet<String> {
    scopes.iter().cloned().collect()
}

fn covers(parent: &[String], child: &[String]) -> bool {
    if parent.iter().any(|s| s == WILDCARD_SCOPE) {
        return true;
    }
    child.iter().all(|s| parent.iter().any(|p| p == s))
}

fn intersect(current: &BTreeSet<String>, parent: &[String]) -> BTreeSet<String> {
    if parent.iter().any(|s| s == WILDCARD_SCOPE) {
        return current.clone();
    }
    if current.contains(WILDCARD_SCOPE) {
        return parent.iter().cloned().collect();
    }
    current
        .iter()
        .filter(|s| parent.iter().any(|p| p == *s))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::credentials::CredentialEngine;
    use crate::types::CredentialType;

    fn setup() -> (Arc<IdentityDb>, CredentialEngine, TokenEngine) {
        let db = Arc::new(IdentityDb::in_memory().unwrap());
        let signer = HmacSigner::new(b"test-identity-secret");
        for agent in ["agt-a", "agt-b", "agt-c"] {
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
        let creds = CredentialEngine::new(db.clone(), signer.clone());
        let tokens = TokenEngine::new(db.clone(), signer);
        (db, creds, tokens)
    }

    fn issue_root(
        creds: &CredentialEngine,
        tokens: &TokenEngine,
        scopes: &[&str],
    ) -> IssuedDelegationToken {
        creds
            .issue(
                "agt-a",
                &["read".into(), "execute".into()],
                3600,
                "owner-dev",
            )
            .unwrap();
        tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-a".into(),
                    subject_agent_id: "agt-b".into(),
                    delegated_scopes: scopes.iter().map(|s| s.to_string()).collect(),
                    ttl_seconds: 3600,
                    parent_token_id: None,
                },
                "owner-dev",
            )
            .unwrap()
    }

    #[test]
    fn issue_and_verify_root() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read", "execute"]);
        assert_eq!(root.chain_depth, 0);

        let verified = tokens.verify(&root.signed_token).unwrap();
        assert!(verified.valid);
        assert_eq!(
            verified.effective_scopes,
            vec!["execute".to_string(), "read".to_string()]
        );
    }

    #[test]
    fn root_requires_active_credentials() {
        let (_db, _creds, tokens) = setup();
        let err = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-a".into(),
                    subject_agent_id: "agt-b".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 3600,
                    parent_token_id: None,
                },
                "owner-dev",
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveCredentials));
    }

    #[test]
    fn child_attenuates_and_inherits_expiry_bound() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read", "execute"]);

        let child = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-b".into(),
                    subject_agent_id: "agt-c".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 600,
                    parent_token_id: Some(root.token_id.clone()),
                },
                "owner-dev",
            )
            .unwrap();
        assert_eq!(child.chain_depth, 1);

        let verified = tokens.verify(&child.signed_token).unwrap();
        assert_eq!(verified.effective_scopes, vec!["read".to_string()]);
        assert_eq!(verified.chain_depth, 1);
    }

    #[test]
    fn scope_escalation_rejected() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read", "execute"]);

        let err = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-b".into(),
                    subject_agent_id: "agt-c".into(),
                    delegated_scopes: vec!["read".into(), "execute".into(), "admin".into()],
                    ttl_seconds: 600,
                    parent_token_id: Some(root.token_id),
                },
                "owner-dev",
            )
            .unwrap_err();
        assert!(matches!(err, Error::ScopeNotAttenuated { .. }));
    }

    #[test]
    fn only_holder_may_redelegate() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read"]);

        // agt-c is not the subject of the root token.
        let err = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-c".into(),
                    subject_agent_id: "agt-a".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 600,
                    parent_token_id: Some(root.token_id),
                },
                "owner-dev",
            )
            .unwrap_err();
        assert!(matches!(err, Error::OwnerMismatch));
    }

    #[test]
    fn sixth_hop_rejected() {
        let (db, creds, tokens) = setup();
        // A long two-party chain: a -> b -> a -> b -> ...
        let root = issue_root(&creds, &tokens, &["read"]);
        let mut parent = root;
        let agents = ["agt-b", "agt-a"];
        for depth in 1..=MAX_CHAIN_DEPTH {
            let issuer = agents[(depth as usize + 1) % 2];
            let subject = agents[depth as usize % 2];
            parent = tokens
                .issue(
                    &IssueTokenRequest {
                        issuer_agent_id: issuer.into(),
                        subject_agent_id: subject.into(),
                        delegated_scopes: vec!["read".into()],
                        ttl_seconds: 3600,
                        parent_token_id: Some(parent.token_id.clone()),
                    },
                    "owner-dev",
                )
                .unwrap();
            assert_eq!(parent.chain_depth, depth);
        }

        let issuer = parent.subject_agent_id.clone();
        let err = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: issuer,
                    subject_agent_id: "agt-c".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 3600,
                    parent_token_id: Some(parent.token_id),
                },
                "owner-dev",
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChainTooDeep { .. }));
        drop(db);
    }

    #[test]
    fn tampered_signature_rejected() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read"]);
        let forged = format!("{}.{}", root.token_id, "0".repeat(64));
        assert!(matches!(
            tokens.verify(&forged).unwrap_err(),
            Error::InvalidSignature
        ));
    }

    #[test]
    fn revoked_parent_invalidates_chain() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read"]);
        let child = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-b".into(),
                    subject_agent_id: "agt-c".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 600,
                    parent_token_id: Some(root.token_id.clone()),
                },
                "owner-dev",
            )
            .unwrap();

        tokens.revoke(&root.token_id, "owner-dev").unwrap();

        // The child was swept by the cascade.
        assert!(matches!(
            tokens.verify(&child.signed_token).unwrap_err(),
            Error::Revoked
        ));
    }

    #[test]
    fn chain_listing_is_root_first() {
        let (_db, creds, tokens) = setup();
        let root = issue_root(&creds, &tokens, &["read", "execute"]);
        let child = tokens
            .issue(
                &IssueTokenRequest {
                    issuer_agent_id: "agt-b".into(),
                    subject_agent_id: "agt-c".into(),
                    delegated_scopes: vec!["read".into()],
                    ttl_seconds: 600,
                    parent_token_id: Some(root.token_id.clone()),
                },
                "owner-dev",
            )
            .unwrap();

        let chain = tokens.chain(&child.token_id).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].token_id, root.token_id);
        assert_eq!(chain[1].token_id, child.token_id);
    }
}
