//! Daemon configuration loaded from environment variables.
//!
//! Fail-closed at boot: every required secret and map must be present and
//! valid or the process refuses to start. Secrets are a process-wide
//! read-only snapshot; there is intentionally no reload endpoint, so no two
//! requests ever see different secrets.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Access-enforcement mode. `Warn` is strictly for migration windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Enforce,
    Warn,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Enforce => "enforce",
            AccessMode::Warn => "warn",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("environment variable {0} must not be empty")]
    EmptyVar(&'static str),
    #[error("environment variable {0} must be a JSON object with non-empty string values")]
    InvalidJsonMap(&'static str),
    #[error("invalid listen address: {0}")]
    InvalidAddr(#[from] std::net::AddrParseError),
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Environment variables the daemon requires to boot.
pub const REQUIRED_ENV_VARS: &[&str] = &[
    "AGENTHUB_IDENTITY_SIGNING_SECRET",
    "AGENTHUB_BEARER_SIGNING_SECRET",
    "AGENTHUB_PROVENANCE_SIGNING_SECRET",
    "AGENTHUB_POLICY_SIGNING_SECRET",
    "AGENTHUB_API_KEYS_JSON",
    "AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON",
];

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub identity_db_path: PathBuf,
    pub hub_db_path: PathBuf,
    pub identity_signing_secret: String,
    pub bearer_signing_secret: String,
    pub provenance_signing_secret: String,
    pub policy_signing_secret: String,
    /// API key -> platform owner.
    pub api_keys: HashMap<String, String>,
    /// Federation domain -> shared token (consumed by the external gateway).
    pub federation_domain_tokens: HashMap<String, String>,
    pub access_mode: AccessMode,
    pub request_timeout_seconds: u64,
    pub admin_owners: HashSet<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = std::env::var("AGENTHUB_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()?;

        let identity_db_path = std::env::var("AGENTHUB_IDENTITY_DB_PATH")
            .unwrap_or_else(|_| "data/identity/identity.db".to_string())
            .into();
        let hub_db_path = std::env::var("AGENTHUB_HUB_DB_PATH")
            .unwrap_or_else(|_| "data/hub/hub.db".to_string())
            .into();

        let identity_signing_secret = required_secret("AGENTHUB_IDENTITY_SIGNING_SECRET")?;
        let bearer_signing_secret = required_secret("AGENTHUB_BEARER_SIGNING_SECRET")?;
        let provenance_signing_secret = required_secret("AGENTHUB_PROVENANCE_SIGNING_SECRET")?;
        let policy_signing_secret = required_secret("AGENTHUB_POLICY_SIGNING_SECRET")?;

        let api_keys = required_json_map("AGENTHUB_API_KEYS_JSON")?;
        let federation_domain_tokens = required_json_map("AGENTHUB_FEDERATION_DOMAIN_TOKENS_JSON")?;

        let access_mode = match std::env::var("AGENTHUB_ACCESS_MODE")
            .unwrap_or_else(|_| "enforce".to_string())
            .as_str()
        {
            "enforce" => AccessMode::Enforce,
            "warn" => AccessMode::Warn,
            other => {
                return Err(ConfigError::InvalidValue {
                    var: "AGENTHUB_ACCESS_MODE",
                    value: other.to_string(),
                })
            }
        };

        let request_timeout_seconds = std::env::var("AGENTHUB_REQUEST_TIMEOUT_SECONDS")
            .ok()
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    var: "AGENTHUB_REQUEST_TIMEOUT_SECONDS",
                    value: raw.clone(),
                })
            })
            .transpose()?
            .unwrap_or(30);

        let admin_owners = std::env::var("AGENTHUB_ADMIN_OWNERS")
            .unwrap_or_else(|_| "owner-dev,owner-platform".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            listen_addr,
            identity_db_path,
            hub_db_path,
            identity_signing_secret,
            bearer_signing_secret,
            provenance_signing_secret,
            policy_signing_secret,
            api_keys,
            federation_domain_tokens,
            access_mode,
            request_timeout_seconds,
            admin_owners,
        })
    }

    pub fn is_admin_owner(&self, owner: &str) -> bool {
        self.admin_owners.contains(owner)
    }
}

fn required_secret(var: &'static str) -> Result<String, ConfigError> {
    let raw = std::env::var(var).map_err(|_| ConfigError::MissingVar(var))?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyVar(var));
    }
    Ok(trimmed.to_string())
}

fn required_json_map(var: &'static str) -> Result<HashMap<String, String>, ConfigError> {
    let raw = std::env::var(var).map_err(|_| ConfigError::MissingVar(var))?;
    let parsed: serde_json::Value =
        serde_json::from_str(raw.trim()).map_err(|_| ConfigError::InvalidJsonMap(var))?;
    let serde_json::Value::Object(map) = parsed else {
        return Err(ConfigError::InvalidJsonMap(var));
    };
    let normalized: HashMap<String, String> = map
        .into_iter()
        .filter_map(|(k, v)| {
            let key = k.trim().to_string();
            let value = v.as_str().map(|s| s.trim().to_string())?;
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key, value))
            }
        })
        .collect();
    if normalized.is_empty() {
        return Err(ConfigError::InvalidJsonMap(var));
    }
    Ok(normalized)
}

impl Config {
    /// A fully-populated config for tests; no environment access.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            identity_db_path: ":memory:".into(),
            hub_db_path: ":memory:".into(),
            identity_signing_secret: "test-identity-secret".into(),
            bearer_signing_secret: "test-bearer-secret".into(),
            provenance_signing_secret: "test-provenance-secret".into(),
            policy_signing_secret: "test-policy-secret".into(),
            api_keys: [
                ("dev-owner-key".to_string(), "owner-dev".to_string()),
                ("partner-owner-key".to_string(), "owner-partner".to_string()),
            ]
            .into_iter()
            .collect(),
            federation_domain_tokens: [("partner.example".to_string(), "fed-token".to_string())]
                .into_iter()
                .collect(),
            access_mode: AccessMode::Enforce,
            request_timeout_seconds: 30,
            admin_owners: ["owner-dev".to_string(), "owner-platform".to_string()]
                .into_iter()
                .collect(),
        }
    }
}
