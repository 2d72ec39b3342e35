use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("owner mismatch")]
    OwnerMismatch,

    #[error("agent identity is {status}")]
    IdentityInactive { agent_id: String, status: String },

    #[error("invalid credential")]
    CredentialInvalid,

    #[error("credential expired")]
    CredentialExpired,

    #[error("credential is {0}")]
    CredentialInactive(String),

    #[error("revoked")]
    Revoked,

    #[error("expired")]
    Expired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("scope escalation denied: {excess:?} not granted by parent")]
    ScopeNotAttenuated { excess: Vec<String> },

    #[error("delegation chain depth limit exceeded: {depth} > {max}")]
    ChainTooDeep { depth: u32, max: u32 },

    #[error("delegation chain invalid at hop {hop}: {reason}")]
    ChainInvalid { hop: u32, reason: String },

    #[error("issuer has no active credentials")]
    NoActiveCredentials,

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Core(#[from] agenthub_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
