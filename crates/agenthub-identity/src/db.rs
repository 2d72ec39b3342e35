//! SQLite-backed identity store (identities, credentials, delegation tokens,
//! revocation events, trust registry, attestations).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::types::{
    iso_from_epoch, AgentCredential, AgentIdentity, CredentialStatus, CredentialType,
    IdentityStatus, DelegationTokenRecord,
};

pub(crate) const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS agent_identities (
    agent_id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    credential_type TEXT NOT NULL,
    status TEXT NOT NULL,
    public_key_pem TEXT,
    human_principal_id TEXT,
    configuration_checksum TEXT,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_agent_identities_owner ON agent_identities(owner);

CREATE TABLE IF NOT EXISTS agent_credentials (
    credential_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agent_identities(agent_id),
    credential_hash TEXT NOT NULL UNIQUE,
    scopes_json TEXT NOT NULL,
    issued_at_epoch INTEGER NOT NULL,
    expires_at_epoch INTEGER NOT NULL,
    rotation_parent_id TEXT,
    status TEXT NOT NULL,
    rotated_at_epoch INTEGER,
    revoked_at TEXT,
    revocation_reason TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_agent_credentials_agent ON agent_credentials(agent_id, status);

CREATE TABLE IF NOT EXISTS delegation_tokens (
    token_id TEXT PRIMARY KEY,
    issuer_agent_id TEXT NOT NULL,
    subject_agent_id TEXT NOT NULL,
    delegated_scopes_json TEXT NOT NULL,
    issued_at_epoch INTEGER NOT NULL,
    expires_at_epoch INTEGER NOT NULL,
    parent_token_id TEXT,
    chain_depth INTEGER NOT NULL,
    signature TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    revoked_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_delegation_tokens_issuer ON delegation_tokens(issuer_agent_id, revoked);
CREATE INDEX IF NOT EXISTS idx_delegation_tokens_subject ON delegation_tokens(subject_agent_id, revoked);
CREATE INDEX IF NOT EXISTS idx_delegation_tokens_parent ON delegation_tokens(parent_token_id);

CREATE TABLE IF NOT EXISTS revocation_events (
    event_id TEXT PRIMARY KEY,
    revoked_type TEXT NOT NULL,
    revoked_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    actor TEXT NOT NULL,
    cascade_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_revocation_events_agent ON revocation_events(agent_id, created_at);

CREATE TABLE IF NOT EXISTS trusted_domains (
    domain_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    trust_level TEXT NOT NULL,
    public_key_pem TEXT,
    allowed_scopes_json TEXT NOT NULL,
    registered_by TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS agent_attestations (
    attestation_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agent_identities(agent_id),
    domain_id TEXT NOT NULL REFERENCES trusted_domains(domain_id),
    claims_json TEXT NOT NULL,
    scopes_json TEXT NOT NULL,
    issued_at_epoch INTEGER NOT NULL,
    expires_at_epoch INTEGER NOT NULL,
    signature TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_agent_attestations_agent ON agent_attestations(agent_id);
"#;

pub struct IdentityDb {
    conn: Mutex<Connection>,
}

impl IdentityDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Invalid(format!("cannot create db directory: {e}")))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(CREATE_TABLES)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }

    // --- Agent identities ---

    pub fn register_identity(
        &self,
        agent_id: &str,
        owner: &str,
        credential_type: CredentialType,
        public_key_pem: Option<&str>,
        human_principal_id: Option<&str>,
        configuration_checksum: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<AgentIdentity> {
        let conn = self.lock_conn();
        let inserted = conn.execute(
            r#"INSERT OR IGNORE INTO agent_identities(
                   agent_id, owner, credential_type, status, public_key_pem,
                   human_principal_id, configuration_checksum, metadata_json
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            rusqlite::params![
                agent_id,
                owner,
                credential_type.as_str(),
                IdentityStatus::Active.as_str(),
                public_key_pem,
                human_principal_id,
                configuration_checksum,
                serde_json::to_string(metadata)?,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists(format!(
                "agent identity already exists: {agent_id}"
            )));
        }
        Self::get_identity_on(&conn, agent_id)
    }

    pub fn get_identity(&self, agent_id: &str) -> Result<AgentIdentity> {
        let conn = self.lock_conn();
        Self::get_identity_on(&conn, agent_id)
    }

    pub(crate) fn get_identity_on(conn: &Connection, agent_id: &str) -> Result<AgentIdentity> {
        conn.query_row(
            "SELECT * FROM agent_identities WHERE agent_id = ?1",
            [agent_id],
            row_to_identity,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("agent identity not found: {agent_id}")))
    }

    pub fn update_identity_status(
        &self,
        agent_id: &str,
        status: IdentityStatus,
    ) -> Result<AgentIdentity> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            r#"UPDATE agent_identities
               SET status = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ', 'now')
               WHERE agent_id = ?2"#,
            rusqlite::params![status.as_str(), agent_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!(
                "agent identity not found: {agent_id}"
            )));
        }
        Self::get_identity_on(&conn, agent_id)
    }

    pub fn list_identities(&self, owner: &str) -> Result<Vec<AgentIdentity>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM agent_identities WHERE owner = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([owner], row_to_identity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Require an identity to be active (issuance / verification gate).
    pub fn require_active_identity(&self, agent_id: &str) -> Result<AgentIdentity> {
        let identity = self.get_identity(agent_id)?;
        if identity.status != IdentityStatus::Active {
            return Err(Error::IdentityInactive {
                agent_id: agent_id.to_string(),
                status: identity.status.as_str().to_string(),
            });
        }
        Ok(identity)
    }

    // --- Credentials (row level; lifecycle logic lives in credentials.rs) ---

    pub fn insert_credential(
        &self,
        credential_id: &str,
        agent_id: &str,
        credential_hash: &str,
        scopes: &[String],
        issued_at_epoch: i64,
        expires_at_epoch: i64,
        rotation_parent_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT INTO agent_credentials(
                   credential_id, agent_id, credential_hash, scopes_json,
                   issued_at_epoch, expires_at_epoch, rotation_parent_id, status
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            rusqlite::params![
                credential_id,
                agent_id,
                credential_hash,
                serde_json::to_string(scopes)?,
                issued_at_epoch,
                expires_at_epoch,
                rotation_parent_id,
                CredentialStatus::Active.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_credential(&self, credential_id: &str) -> Result<AgentCredential> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT * FROM agent_credentials WHERE credential_id = ?1",
            [credential_id],
            row_to_credential,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("credential not found: {credential_id}")))
    }

    /// O(1) lookup by credential hash (unique index).
    pub fn find_credential_by_hash(&self, credential_hash: &str) -> Result<Option<AgentCredential>> {
        let conn = self.lock_conn();
        Ok(conn
            .query_row(
                "SELECT * FROM agent_credentials WHERE credential_hash = ?1",
                [credential_hash],
                row_to_credential,
            )
            .optional()?)
    }

    pub fn mark_credential_rotated(&self, credential_id: &str, rotated_at_epoch: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE agent_credentials SET status = ?1, rotated_at_epoch = ?2 WHERE credential_id = ?3",
            rusqlite::params![CredentialStatus::Rotated.as_str(), rotated_at_epoch, credential_id],
        )?;
        Ok(())
    }

    pub fn list_active_credentials(&self, agent_id: &str) -> Result<Vec<AgentCredential>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            r#"SELECT * FROM agent_credentials
               WHERE agent_id = ?1 AND status = 'active'
               ORDER BY issued_at_epoch DESC"#,
        )?;
        let rows = stmt
            .query_map([agent_id], row_to_credential)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Delegation tokens (row level; engine logic lives in tokens.rs) ---

    pub fn get_token(&self, token_id: &str) -> Result<Option<DelegationTokenRecord>> {
        let conn = self.lock_conn();
        Self::get_token_on(&conn, token_id)
    }

    pub(crate) fn get_token_on(
        conn: &Connection,
        token_id: &str,
    ) -> Result<Option<DelegationTokenRecord>> {
        Ok(conn
            .query_row(
                "SELECT * FROM delegation_tokens WHERE token_id = ?1",
                [token_id],
                row_to_token,
            )
            .optional()?)
    }

    pub fn insert_token(&self, rec: &DelegationTokenRecord) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT INTO delegation_tokens(
                   token_id, issuer_agent_id, subject_agent_id, delegated_scopes_json,
                   issued_at_epoch, expires_at_epoch, parent_token_id, chain_depth,
                   signature, revoked
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)"#,
            rusqlite::params![
                rec.token_id,
                rec.issuer_agent_id,
                rec.subject_agent_id,
                serde_json::to_string(&rec.delegated_scopes)?,
                rec.issued_at_epoch,
                rec.expires_at_epoch,
                rec.parent_token_id,
                rec.chain_depth,
                rec.signature,
            ],
        )?;
        Ok(())
    }
}

pub(crate) fn row_to_identity(row: &Row<'_>) -> rusqlite::Result<AgentIdentity> {
    let metadata_raw: String = row.get("metadata_json")?;
    let credential_type: String = row.get("credential_type")?;
    let status: String = row.get("status")?;
    Ok(AgentIdentity {
        agent_id: row.get("agent_id")?,
        owner: row.get("owner")?,
        credential_type: CredentialType::parse(&credential_type)
            .unwrap_or(CredentialType::ApiKey),
        status: IdentityStatus::parse(&status).unwrap_or(IdentityStatus::Revoked),
        public_key_pem: row.get("public_key_pem")?,
        human_principal_id: row.get("human_principal_id")?,
        configuration_checksum: row.get("configuration_checksum")?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(crate) fn row_to_credential(row: &Row<'_>) -> rusqlite::Result<AgentCredential> {
    let scopes_raw: String = row.get("scopes_json")?;
    let status: String = row.get("status")?;
    let issued_at_epoch: i64 = row.get("issued_at_epoch")?;
    let expires_at_epoch: i64 = row.get("expires_at_epoch")?;
    Ok(AgentCredential {
        credential_id: row.get("credential_id")?,
        agent_id: row.get("agent_id")?,
        scopes: serde_json::from_str(&scopes_raw).unwrap_or_default(),
        issued_at: iso_from_epoch(issued_at_epoch),
        expires_at: iso_from_epoch(expires_at_epoch),
        rotation_parent_id: row.get("rotation_parent_id")?,
        status: CredentialStatus::parse(&status).unwrap_or(CredentialStatus::Revoked),
        revoked_at: row.get("revoked_at")?,
        revocation_reason: row.get("revocation_reason")?,
        issued_at_epoch,
        expires_at_epoch,
        rotated_at_epoch: row.get("rotated_at_epoch")?,
    })
}

pub(crate) fn row_to_token(row: &Row<'_>) -> rusqlite::Result<DelegationTokenRecord> {
    let scopes_raw: String = row.get("delegated_scopes_json")?;
    let revoked: i64 = row.get("revoked")?;
    Ok(DelegationTokenRecord {
        token_id: row.get("token_id")?,
        issuer_agent_id: row.get("issuer_agent_id")?,
        subject_agent_id: row.get("subject_agent_id")?,
        delegated_scopes: serde_json::from_str(&scopes_raw).unwrap_or_default(),
        issued_at_epoch: row.get("issued_at_epoch")?,
        expires_at_epoch: row.get("expires_at_epoch")?,
        parent_token_id: row.get("parent_token_id")?,
        chain_depth: row.get::<_, i64>("chain_depth")? as u32,
        signature: row.get("signature")?,
        revoked: revoked != 0,
        revoked_at: row.get("revoked_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_round_trip() {
        let db = IdentityDb::in_memory().unwrap();
        let identity = db
            .register_identity(
                "agt-1",
                "owner-dev",
                CredentialType::ApiKey,
                None,
                None,
                None,
                &BTreeMap::new(),
            )
            .unwrap();
        assert_eq!(identity.agent_id, "agt-1");
        assert_eq!(identity.status, IdentityStatus::Active);

        let got = db.get_identity("agt-1").unwrap();
        assert_eq!(got.owner, "owner-dev");
    }

    #[test]
    fn duplicate_registration_fails() {
        let db = IdentityDb::in_memory().unwrap();
        db.register_identity(
            "agt-1",
            "owner-dev",
            CredentialType::ApiKey,
            None,
            None,
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        let err = db
            .register_identity(
                "agt-1",
                "owner-dev",
                CredentialType::ApiKey,
                None,
                None,
                None,
                &BTreeMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn status_update_and_gate() {
        let db = IdentityDb::in_memory().unwrap();
        db.register_identity(
            "agt-1",
            "owner-dev",
            CredentialType::Jwt,
            None,
            None,
            None,
            &BTreeMap::new(),
        )
        .unwrap();

        assert!(db.require_active_identity("agt-1").is_ok());
        db.update_identity_status("agt-1", IdentityStatus::Suspended)
            .unwrap();
        let err = db.require_active_identity("agt-1").unwrap_err();
        assert!(matches!(err, Error::IdentityInactive { .. }));
    }

    #[test]
    fn unknown_identity_not_found() {
        let db = IdentityDb::in_memory().unwrap();
        assert!(matches!(
            db.get_identity("missing").unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
