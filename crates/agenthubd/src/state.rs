//! Shared application state for the daemon.

use std::sync::Arc;

use agenthub_core::HmacSigner;
use agenthub_identity::{
    CredentialEngine, FederationEngine, IdentityDb, RevocationEngine, TokenEngine,
};
use agenthub_policy::PolicySigner;

use crate::budget::BudgetStore;
use crate::config::Config;
use crate::db::HubDb;
use crate::error::ApiError;
use crate::idempotency::IdempotencyStore;
use crate::lifecycle::LifecycleEngine;
use crate::reliability::ReliabilityService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity_db: Arc<IdentityDb>,
    pub hub: Arc<HubDb>,
    pub credentials: Arc<CredentialEngine>,
    pub tokens: Arc<TokenEngine>,
    pub revocation: Arc<RevocationEngine>,
    pub federation: Arc<FederationEngine>,
    pub policy: Arc<PolicySigner>,
    pub budget: Arc<BudgetStore>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub reliability: Arc<ReliabilityService>,
    pub idempotency: Arc<IdempotencyStore>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, ApiError> {
        let identity_db = Arc::new(
            IdentityDb::open(&config.identity_db_path)
                .map_err(|e| ApiError::Internal(format!("identity db: {e}")))?,
        );
        let hub = Arc::new(HubDb::open(&config.hub_db_path)?);
        Self::with_stores(config, identity_db, hub)
    }

    /// State over in-memory stores (tests).
    pub fn in_memory(config: Config) -> Result<Self, ApiError> {
        let identity_db = Arc::new(
            IdentityDb::in_memory().map_err(|e| ApiError::Internal(format!("identity db: {e}")))?,
        );
        let hub = Arc::new(HubDb::in_memory()?);
        Self::with_stores(config, identity_db, hub)
    }

    fn with_stores(
        config: Config,
        identity_db: Arc<IdentityDb>,
        hub: Arc<HubDb>,
    ) -> Result<Self, ApiError> {
        let identity_signer = HmacSigner::new(config.identity_signing_secret.as_bytes());
        let policy = Arc::new(PolicySigner::new(config.policy_signing_secret.as_bytes()));
        let provenance = HmacSigner::new(config.provenance_signing_secret.as_bytes());

        let credentials = Arc::new(CredentialEngine::new(
            identity_db.clone(),
            identity_signer.clone(),
        ));
        let tokens = Arc::new(TokenEngine::new(identity_db.clone(), identity_signer.clone()));
        let revocation = Arc::new(RevocationEngine::new(identity_db.clone()));
        let federation = Arc::new(FederationEngine::new(identity_db.clone(), identity_signer));

        let budget = Arc::new(BudgetStore::new(hub.clone()));
        let lifecycle = Arc::new(LifecycleEngine::new(
            hub.clone(),
            identity_db.clone(),
            policy.clone(),
            provenance,
        ));
        let reliability = Arc::new(ReliabilityService::new(hub.clone()));
        let idempotency = Arc::new(IdempotencyStore::new(
            hub.clone(),
            config.request_timeout_seconds as i64,
        ));

        Ok(Self {
            config: Arc::new(config),
            identity_db,
            hub,
            credentials,
            tokens,
            revocation,
            federation,
            policy,
            budget,
            lifecycle,
            reliability,
            idempotency,
            started_at: chrono::Utc::now(),
        })
    }

    pub fn uptime_secs(&self) -> i64 {
        (chrono::Utc::now() - self.started_at).num_seconds()
    }
}
