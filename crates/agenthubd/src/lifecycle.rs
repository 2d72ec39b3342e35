//! Delegation lifecycle engine.
//!
//! Six strictly ordered stages: discovery -> negotiation -> execution ->
//! delivery -> settlement -> feedback. Every transition is persisted in its
//! own transaction together with any money movement, so the engine holds no
//! in-process continuation state: any process can pick up a stalled
//! delegation from the store and resume it from its last persisted stage.

use std::sync::Arc;
use std::time::Duration;

use agenthub_core::{canonical, HmacSigner};
use agenthub_identity::IdentityDb;
use agenthub_policy::{
    abac_violations, build_decision, AbacContext, Environment, PolicyDecision, PolicySigner,
    PrincipalAttributes, ResourceAttributes,
};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{now_epoch, HubDb};
use crate::error::ApiError;
use crate::outbox;

/// Version constant of the delegation contract.
pub const CONTRACT_VERSION: &str = "delegation-contract-v2";

/// Requester balance granted on first touch.
const DEFAULT_BALANCE_USD: f64 = 1000.0;

/// Running rows with a heartbeat older than this are reclaimed.
pub const HEARTBEAT_STALE_SECONDS: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Negotiation,
    Execution,
    Delivery,
    Settlement,
    Feedback,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Negotiation => "negotiation",
            Stage::Execution => "execution",
            Stage::Delivery => "delivery",
            Stage::Settlement => "settlement",
            Stage::Feedback => "feedback",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "negotiation" => Stage::Negotiation,
            "execution" => Stage::Execution,
            "delivery" => Stage::Delivery,
            "settlement" => Stage::Settlement,
            "feedback" => Stage::Feedback,
            _ => Stage::Discovery,
        }
    }

    fn next(&self) -> Option<Stage> {
        match self {
            Stage::Discovery => Some(Stage::Negotiation),
            Stage::Negotiation => Some(Stage::Execution),
            Stage::Execution => Some(Stage::Delivery),
            Stage::Delivery => Some(Stage::Settlement),
            Stage::Settlement => Some(Stage::Feedback),
            Stage::Feedback => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Queued,
    Running,
    Settled,
    Failed,
    Cancelled,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Queued => "queued",
            DelegationStatus::Running => "running",
            DelegationStatus::Settled => "settled",
            DelegationStatus::Failed => "failed",
            DelegationStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => DelegationStatus::Running,
            "settled" => DelegationStatus::Settled,
            "failed" => DelegationStatus::Failed,
            "cancelled" => DelegationStatus::Cancelled,
            _ => DelegationStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DelegationStatus::Settled | DelegationStatus::Failed | DelegationStatus::Cancelled
        )
    }
}

/// Failure classes of the retry matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    TransientNetworkError,
    DelegateTimeout,
    PolicyDenied,
    HardStopBudget,
}

impl RetryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryClass::TransientNetworkError => "transient_network_error",
            RetryClass::DelegateTimeout => "delegate_timeout",
            RetryClass::PolicyDenied => "policy_denied",
            RetryClass::HardStopBudget => "hard_stop_budget",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient_network_error" => Some(RetryClass::TransientNetworkError),
            "delegate_timeout" => Some(RetryClass::DelegateTimeout),
            "policy_denied" => Some(RetryClass::PolicyDenied),
            "hard_stop_budget" => Some(RetryClass::HardStopBudget),
            _ => None,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            RetryClass::TransientNetworkError => 2,
            RetryClass::DelegateTimeout => 1,
            RetryClass::PolicyDenied | RetryClass::HardStopBudget => 0,
        }
    }

    pub fn backoff_ms(&self) -> &'static [u64] {
        match self {
            RetryClass::TransientNetworkError => &[100, 250],
            RetryClass::DelegateTimeout => &[200],
            RetryClass::PolicyDenied | RetryClass::HardStopBudget => &[],
        }
    }
}

/// The full delegation contract: version, SLA, retry matrix, thresholds.
pub fn delegation_contract() -> serde_json::Value {
    serde_json::json!({
        "version": CONTRACT_VERSION,
        "idempotency_required": true,
        "sla": {
            "p95_latency_ms_target": 3000,
            "max_end_to_end_timeout_ms": 8000,
        },
        "timeouts_ms": {
            "discovery": 500,
            "negotiation": 800,
            "execution": 5000,
            "delivery": 800,
            "settlement": 900,
        },
        "retry_matrix": {
            "transient_network_error": {"max_retries": 2, "backoff_ms": [100, 250], "idempotency_required": true},
            "delegate_timeout": {"max_retries": 1, "backoff_ms": [200], "idempotency_required": true},
            "policy_denied": {"max_retries": 0, "backoff_ms": [], "idempotency_required": true},
            "hard_stop_budget": {"max_retries": 0, "backoff_ms": [], "idempotency_required": true},
        },
        "budget_thresholds": {
            "soft_alert_pct": 80,
            "reauthorization_pct": 100,
            "hard_stop_pct": 120,
        },
    })
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateDelegation {
    pub requester_agent_id: String,
    pub delegate_agent_id: String,
    pub task_spec: String,
    pub estimated_cost_usd: f64,
    pub max_budget_usd: f64,
    #[serde(default)]
    pub simulated_actual_cost_usd: Option<f64>,
    #[serde(default)]
    pub simulated_failure_class: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reauthorize: bool,
}

fn default_true() -> bool {
    true
}

/// Caller context forwarded into the policy evaluation.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub owner: String,
    pub tenant_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DelegationView {
    pub delegation_id: String,
    pub requester_agent_id: String,
    pub delegate_agent_id: String,
    pub status: DelegationStatus,
    pub stage: Stage,
    pub estimated_cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_cost_usd: Option<f64>,
    pub max_budget_usd: f64,
    pub attempt_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub lifecycle: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_decision: Option<serde_json::Value>,
}

struct DelegationRow {
    delegation_id: String,
    requester_agent_id: String,
    delegate_agent_id: String,
    task_spec: String,
    estimated_cost_usd: f64,
    actual_cost_usd: Option<f64>,
    max_budget_usd: f64,
    status: DelegationStatus,
    stage: Stage,
    failure_class: Option<String>,
    attempt_count: i64,
    last_error: Option<String>,
    latency_ms: Option<f64>,
    lifecycle_json: String,
    policy_decision_json: Option<String>,
    simulated_actual_cost_usd: Option<f64>,
    simulated_failure_class: Option<String>,
    auto_reauthorize: bool,
    cancel_requested: bool,
}

pub struct LifecycleEngine {
    hub: Arc<HubDb>,
    identity: Arc<IdentityDb>,
    policy: Arc<PolicySigner>,
    provenance: HmacSigner,
}

impl LifecycleEngine {
    pub fn new(
        hub: Arc<HubDb>,
        identity: Arc<IdentityDb>,
        policy: Arc<PolicySigner>,
        provenance: HmacSigner,
    ) -> Self {
        Self {
            hub,
            identity,
            policy,
            provenance,
        }
    }

    /// Create a delegation and drive it through the pipeline.
    pub async fn create(
        &self,
        req: &CreateDelegation,
        ctx: &RequestContext,
    ) -> Result<DelegationView, ApiError> {
        if req.estimated_cost_usd.is_nan() || req.estimated_cost_usd < 0.0 {
            return Err(ApiError::validation("estimated_cost_usd must be >= 0"));
        }
        if req.max_budget_usd.is_nan() || req.max_budget_usd <= 0.0 {
            return Err(ApiError::validation("max_budget_usd must be positive"));
        }
        if req.estimated_cost_usd > req.max_budget_usd {
            return Err(ApiError::validation(
                "hard ceiling exceeded: estimated cost above max budget",
            ));
        }
        if let Some(class) = &req.simulated_failure_class {
            if RetryClass::parse(class).is_none() {
                return Err(ApiError::validation(format!(
                    "unknown failure class: {class}"
                )));
            }
        }

        let delegation_id = Uuid::new_v4().to_string();
        let now = now_epoch();
        {
            let conn = self.hub.lock_conn();
            conn.execute(
                r#"INSERT INTO delegations(
                       delegation_id, requester_agent_id, delegate_agent_id, task_spec,
                       estimated_cost_usd, max_budget_usd, status, stage,
                       simulated_actual_cost_usd, simulated_failure_class, auto_reauthorize,
                       heartbeat_at_epoch, created_at_epoch, updated_at_epoch
                   ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 'discovery', ?7, ?8, ?9, ?10, ?10, ?10)"#,
                rusqlite::params![
                    delegation_id,
                    req.requester_agent_id,
                    req.delegate_agent_id,
                    req.task_spec,
                    req.estimated_cost_usd,
                    req.max_budget_usd,
                    req.simulated_actual_cost_usd,
                    req.simulated_failure_class,
                    req.auto_reauthorize,
                    now,
                ],
            )?;
        }

        let result = self.run(&delegation_id, Some(ctx)).await;
        match result {
            Ok(()) => self.view(&delegation_id),
            Err(err) => Err(err),
        }
    }

    /// Drive a delegation from its last persisted stage to a terminal
    /// state. Used by `create` and by the reaper after a crash.
    pub async fn run(&self, delegation_id: &str, ctx: Option<&RequestContext>) -> Result<(), ApiError> {
        loop {
            let row = self.load(delegation_id)?;
            if row.status.is_terminal() {
                return Ok(());
            }
            if row.cancel_requested {
                self.cancel(&row, "owner revoked while in flight")?;
                return Ok(());
            }

            match row.stage {
                Stage::Discovery => self.stage_discovery(&row, ctx)?,
                Stage::Negotiation => self.stage_negotiation(&row)?,
                Stage::Execution => self.stage_execution(&row).await?,
                Stage::Delivery => self.stage_delivery(&row)?,
                Stage::Settlement => self.stage_settlement(&row)?,
                Stage::Feedback => {
                    self.stage_feedback(&row)?;
                    return Ok(());
                }
            }
        }
    }

    /// Current state of a delegation; applies any pending cancellation.
    pub fn status(&self, delegation_id: &str) -> Result<DelegationView, ApiError> {
        let row = self.load(delegation_id)?;
        if row.cancel_requested && !row.status.is_terminal() {
            self.cancel(&row, "owner revoked while in flight")?;
        }
        self.view(delegation_id)
    }

    /// Flag every non-terminal delegation touching an agent for
    /// cancellation; they transition to `cancelled` on next touch. Returns
    /// the number of rows flagged.
    pub fn flag_cancellations_for_agent(&self, agent_id: &str) -> Result<i64, ApiError> {
        let conn = self.hub.lock_conn();
        let flagged = conn.execute(
            r#"UPDATE delegations SET cancel_requested = 1, updated_at_epoch = ?1
               WHERE (requester_agent_id = ?2 OR delegate_agent_id = ?2)
                 AND status IN ('queued', 'running')"#,
            rusqlite::params![now_epoch(), agent_id],
        )?;
        Ok(flagged as i64)
    }

    /// Reclaim running delegations whose heartbeat went stale and resume
    /// them from their last persisted stage.
    pub async fn reap_stale(&self) -> Result<usize, ApiError> {
        let stale_ids: Vec<String> = {
            let conn = self.hub.lock_conn();
            let mut stmt = conn.prepare(
                r#"SELECT delegation_id FROM delegations
                   WHERE status IN ('queued', 'running')
                     AND heartbeat_at_epoch IS NOT NULL
                     AND heartbeat_at_epoch < ?1"#,
            )?;
            let rows = stmt
                .query_map([now_epoch() - HEARTBEAT_STALE_SECONDS], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for delegation_id in &stale_ids {
            tracing::warn!(delegation_id = %delegation_id, "reclaiming stale delegation");
            if let Err(err) = self.run(delegation_id, None).await {
                tracing::warn!(delegation_id = %delegation_id, error = %err, "resume failed");
            }
        }
        Ok(stale_ids.len())
    }

    // --- Stages ---

    fn stage_discovery(
        &self,
        row: &DelegationRow,
        ctx: Option<&RequestContext>,
    ) -> Result<(), ApiError> {
        self.identity
            .require_active_identity(&row.delegate_agent_id)
            .map_err(|err| {
                let api: ApiError = err.into();
                let _ = self.mark_failed(row, Some(RetryClass::PolicyDenied), "delegate not active");
                api
            })?;

        let decision = self.evaluate_policy(row, ctx);
        if !decision.allowed {
            let _ = self.mark_failed(row, Some(RetryClass::PolicyDenied), "policy denied");
            return Err(ApiError::Forbidden {
                code: "policy.denied".to_string(),
                message: "policy denied delegation".to_string(),
                fields: Some(serde_json::json!({
                    "policy_decision": serde_json::to_value(&decision)?,
                })),
            });
        }

        self.advance(
            row,
            Stage::Discovery,
            serde_json::json!({
                "requester": row.requester_agent_id,
                "delegate": row.delegate_agent_id,
            }),
            |tx| {
                tx.execute(
                    "UPDATE delegations SET policy_decision_json = ?1 WHERE delegation_id = ?2",
                    rusqlite::params![serde_json::to_string(&decision)?, row.delegation_id],
                )?;
                Ok(())
            },
        )
    }

    fn stage_negotiation(&self, row: &DelegationRow) -> Result<(), ApiError> {
        let escrow = row.estimated_cost_usd;
        let mut conn = self.hub.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let balance: f64 = tx
            .query_row(
                "SELECT balance_usd FROM delegation_balances WHERE agent_id = ?1",
                [&row.requester_agent_id],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(DEFAULT_BALANCE_USD);

        if balance < escrow {
            drop(tx);
            drop(conn);
            let _ = self.mark_failed(row, None, "insufficient requester balance for escrow");
            return Err(ApiError::PaymentRequired {
                code: "budget.insufficient_balance",
                message: "insufficient requester balance for escrow".to_string(),
                fields: Some(serde_json::json!({
                    "balance_usd": balance,
                    "escrow_usd": escrow,
                })),
            });
        }

        tx.execute(
            r#"INSERT INTO delegation_balances(agent_id, balance_usd) VALUES (?1, ?2)
               ON CONFLICT(agent_id) DO UPDATE SET balance_usd = ?2"#,
            rusqlite::params![row.requester_agent_id, balance - escrow],
        )?;

        Self::advance_tx(
            &tx,
            row,
            Stage::Negotiation,
            serde_json::json!({
                "estimated_cost_usd": row.estimated_cost_usd,
                "max_budget_usd": row.max_budget_usd,
                "escrow_usd": escrow,
            }),
        )?;
        tx.execute(
            "UPDATE delegations SET status = 'running' WHERE delegation_id = ?1",
            [&row.delegation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn stage_execution(&self, row: &DelegationRow) -> Result<(), ApiError> {
        let injected = row
            .simulated_failure_class
            .as_deref()
            .and_then(RetryClass::parse);

        let started = std::time::Instant::now();
        match injected {
            None => {
                self.bump_attempt(row)?;
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.advance(
                    row,
                    Stage::Execution,
                    serde_json::json!({
                        "sandbox": "simulated",
                        "network": "disabled",
                        "latency_ms": latency_ms,
                    }),
                    |tx| {
                        tx.execute(
                            "UPDATE delegations SET latency_ms = ?1 WHERE delegation_id = ?2",
                            rusqlite::params![latency_ms, row.delegation_id],
                        )?;
                        Ok(())
                    },
                )
            }
            Some(class) => {
                let attempts = 1 + class.max_retries();
                for attempt in 0..attempts {
                    self.bump_attempt(row)?;
                    if let Some(delay) = class.backoff_ms().get(attempt as usize) {
                        tokio::time::sleep(Duration::from_millis(*delay)).await;
                    }
                }
                self.refund_escrow(row)?;
                self.mark_failed(
                    row,
                    Some(class),
                    &format!("delegate execution failed: {}", class.as_str()),
                )?;
                Err(ApiError::Internal(format!(
                    "delegate execution failed after retries: {}",
                    class.as_str()
                )))
            }
        }
    }

    fn stage_delivery(&self, row: &DelegationRow) -> Result<(), ApiError> {
        // The simulated delegate always produces the structured output
        // contract marker; a real sandbox result is validated here.
        self.advance(
            row,
            Stage::Delivery,
            serde_json::json!({
                "output_schema_valid": true,
                "latency_ms": row.latency_ms,
            }),
            |_| Ok(()),
        )
    }

    fn stage_settlement(&self, row: &DelegationRow) -> Result<(), ApiError> {
        let actual = row
            .simulated_actual_cost_usd
            .unwrap_or(row.estimated_cost_usd * 0.92);
        let ratio = actual / row.max_budget_usd;

        if actual > 1.2 * row.max_budget_usd {
            self.refund_escrow(row)?;
            self.mark_failed(
                row,
                Some(RetryClass::HardStopBudget),
                "actual cost exceeded hard budget ceiling",
            )?;
            return Err(ApiError::PaymentRequired {
                code: "budget.hard_stop",
                message: "actual cost exceeded hard budget ceiling".to_string(),
                fields: Some(serde_json::json!({
                    "spend_ratio": (ratio * 10_000.0).round() / 10_000.0,
                    "actual_cost_usd": actual,
                    "max_budget_usd": row.max_budget_usd,
                })),
            });
        }
        if ratio >= 1.0 && !row.auto_reauthorize {
            self.refund_escrow(row)?;
            self.mark_failed_with_class_str(row, "reauthorization_required", "budget reauthorization required")?;
            return Err(ApiError::PaymentRequired {
                code: "budget.reauth_required",
                message: "budget reauthorization required".to_string(),
                fields: Some(serde_json::json!({
                    "spend_ratio": (ratio * 10_000.0).round() / 10_000.0,
                })),
            });
        }

        let refund = (row.estimated_cost_usd - actual).max(0.0);
        let mut conn = self.hub.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        tx.execute(
            r#"INSERT INTO delegation_balances(agent_id, balance_usd)
               VALUES (?1, ?2 + ?3)
               ON CONFLICT(agent_id) DO UPDATE SET balance_usd = balance_usd + ?3"#,
            rusqlite::params![row.requester_agent_id, DEFAULT_BALANCE_USD, refund],
        )?;
        tx.execute(
            "UPDATE delegations SET actual_cost_usd = ?1 WHERE delegation_id = ?2",
            rusqlite::params![actual, row.delegation_id],
        )?;
        outbox::enqueue_tx(
            &tx,
            "billing.settlement",
            &serde_json::json!({
                "delegation_id": row.delegation_id,
                "actual_cost_usd": actual,
                "escrow_refund_usd": refund,
            }),
        )?;
        Self::advance_tx(
            &tx,
            row,
            Stage::Settlement,
            serde_json::json!({
                "settlement_status": "completed",
                "estimated_cost_usd": row.estimated_cost_usd,
                "actual_cost_usd": actual,
                "escrow_refund_usd": refund,
                "budget_state": budget_state_label(ratio),
                "spend_ratio": (ratio * 10_000.0).round() / 10_000.0,
            }),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn stage_feedback(&self, row: &DelegationRow) -> Result<(), ApiError> {
        let actual = row
            .actual_cost_usd
            .or(row.simulated_actual_cost_usd)
            .unwrap_or(row.estimated_cost_usd * 0.92);

        let payload = serde_json::json!({
            "delegation_id": row.delegation_id,
            "delegate_agent_id": row.delegate_agent_id,
            "success": true,
            "cost_usd": actual,
            "latency_ms": row.latency_ms,
        });
        let signature = canonical::canonical_bytes(&payload)
            .map(|bytes| self.provenance.sign(&bytes))
            .unwrap_or_default();

        let mut conn = self.hub.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        outbox::enqueue_tx(
            &tx,
            "trust.usage_signal",
            &serde_json::json!({
                "format": "provenance-v1",
                "payload": payload,
                "signature": signature,
            }),
        )?;
        Self::advance_tx(
            &tx,
            row,
            Stage::Feedback,
            serde_json::json!({ "success": true, "quality_score": 1.0 }),
        )?;
        tx.execute(
            "UPDATE delegations SET status = 'settled' WHERE delegation_id = ?1",
            [&row.delegation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Internals ---

    fn evaluate_policy(&self, row: &DelegationRow, ctx: Option<&RequestContext>) -> PolicyDecision {
        let tenant = ctx.map(|c| c.tenant_id.clone());
        let abac = AbacContext {
            principal: PrincipalAttributes {
                tenant_id: tenant.clone(),
                allowed_actions: vec!["delegation.create".to_string()],
                mfa_present: true,
                owner: ctx.map(|c| c.owner.clone()),
            },
            resource: ResourceAttributes { tenant_id: tenant },
            environment: Environment {
                requires_mfa: false,
            },
        };
        let reasons = abac_violations("delegation.create", &abac);
        build_decision(
            &self.policy,
            "runtime.delegation",
            "delegation.create",
            ctx.map(|c| c.owner.as_str()).unwrap_or("system.reaper"),
            serde_json::json!({
                "requester_agent_id": row.requester_agent_id,
                "delegate_agent_id": row.delegate_agent_id,
            }),
            serde_json::json!({
                "estimated_cost_usd": row.estimated_cost_usd,
                "max_budget_usd": row.max_budget_usd,
                "task_spec_len": row.task_spec.len(),
            }),
            reasons,
        )
    }

    fn load(&self, delegation_id: &str) -> Result<DelegationRow, ApiError> {
        let conn = self.hub.lock_conn();
        conn.query_row(
            "SELECT * FROM delegations WHERE delegation_id = ?1",
            [delegation_id],
            |row| {
                let status: String = row.get("status")?;
                let stage: String = row.get("stage")?;
                let cancel_requested: i64 = row.get("cancel_requested")?;
                let auto_reauthorize: i64 = row.get("auto_reauthorize")?;
                Ok(DelegationRow {
                    delegation_id: row.get("delegation_id")?,
                    requester_agent_id: row.get("requester_agent_id")?,
                    delegate_agent_id: row.get("delegate_agent_id")?,
                    task_spec: row.get("task_spec")?,
                    estimated_cost_usd: row.get("estimated_cost_usd")?,
                    actual_cost_usd: row.get("actual_cost_usd")?,
                    max_budget_usd: row.get("max_budget_usd")?,
                    status: DelegationStatus::parse(&status),
                    stage: Stage::parse(&stage),
                    failure_class: row.get("failure_class")?,
                    attempt_count: row.get("attempt_count")?,
                    last_error: row.get("last_error")?,
                    latency_ms: row.get("latency_ms")?,
                    lifecycle_json: row.get("lifecycle_json")?,
                    policy_decision_json: row.get("policy_decision_json")?,
                    simulated_actual_cost_usd: row.get("simulated_actual_cost_usd")?,
                    simulated_failure_class: row.get("simulated_failure_class")?,
                    auto_reauthorize: auto_reauthorize != 0,
                    cancel_requested: cancel_requested != 0,
                })
            },
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found(format!("delegation not found: {delegation_id}")))
    }

    fn view(&self, delegation_id: &str) -> Result<DelegationView, ApiError> {
        let row = self.load(delegation_id)?;
        Ok(DelegationView {
            delegation_id: row.delegation_id,
            requester_agent_id: row.requester_agent_id,
            delegate_agent_id: row.delegate_agent_id,
            status: row.status,
            stage: row.stage,
            estimated_cost_usd: row.estimated_cost_usd,
            actual_cost_usd: row.actual_cost_usd,
            max_budget_usd: row.max_budget_usd,
            attempt_count: row.attempt_count,
            failure_class: row.failure_class,
            last_error: row.last_error,
            latency_ms: row.latency_ms,
            lifecycle: serde_json::from_str(&row.lifecycle_json)
                .unwrap_or(serde_json::Value::Array(Vec::new())),
            policy_decision: row
                .policy_decision_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
        })
    }

    /// Persist a completed stage: append to the lifecycle log, advance the
    /// stage pointer, refresh the heartbeat. `extra` runs in the same
    /// transaction.
    fn advance<F>(
        &self,
        row: &DelegationRow,
        stage: Stage,
        details: serde_json::Value,
        extra: F,
    ) -> Result<(), ApiError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<(), ApiError>,
    {
        let mut conn = self.hub.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        Self::advance_tx(&tx, row, stage, details)?;
        extra(&tx)?;
        tx.commit()?;
        Ok(())
    }

    fn advance_tx(
        tx: &rusqlite::Transaction<'_>,
        row: &DelegationRow,
        stage: Stage,
        details: serde_json::Value,
    ) -> Result<(), ApiError> {
        let mut lifecycle: Vec<serde_json::Value> =
            serde_json::from_str(&row.lifecycle_json).unwrap_or_default();
        lifecycle.push(serde_json::json!({
            "stage": stage.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "details": details,
        }));

        let next_stage = stage.next().unwrap_or(Stage::Feedback);
        tx.execute(
            r#"UPDATE delegations
               SET stage = ?1, lifecycle_json = ?2, heartbeat_at_epoch = ?3, updated_at_epoch = ?3
               WHERE delegation_id = ?4"#,
            rusqlite::params![
                next_stage.as_str(),
                serde_json::to_string(&lifecycle)?,
                now_epoch(),
                row.delegation_id,
            ],
        )?;
        Ok(())
    }

    fn bump_attempt(&self, row: &DelegationRow) -> Result<(), ApiError> {
        let conn = self.hub.lock_conn();
        conn.execute(
            r#"UPDATE delegations
               SET attempt_count = attempt_count + 1, heartbeat_at_epoch = ?1, updated_at_epoch = ?1
               WHERE delegation_id = ?2"#,
            rusqlite::params![now_epoch(), row.delegation_id],
        )?;
        Ok(())
    }

    /// Return escrow to the requester if it was debited (stage is past
    /// negotiation) and the delegation did not settle.
    fn refund_escrow(&self, row: &DelegationRow) -> Result<(), ApiError> {
        if matches!(row.stage, Stage::Discovery | Stage::Negotiation) {
            return Ok(());
        }
        let conn = self.hub.lock_conn();
        conn.execute(
            r#"INSERT INTO delegation_balances(agent_id, balance_usd)
               VALUES (?1, ?2 + ?3)
               ON CONFLICT(agent_id) DO UPDATE SET balance_usd = balance_usd + ?3"#,
            rusqlite::params![
                row.requester_agent_id,
                DEFAULT_BALANCE_USD,
                row.estimated_cost_usd
            ],
        )?;
        Ok(())
    }

    fn mark_failed(
        &self,
        row: &DelegationRow,
        class: Option<RetryClass>,
        message: &str,
    ) -> Result<(), ApiError> {
        self.mark_failed_with_class_str(row, class.map(|c| c.as_str()).unwrap_or(""), message)
    }

    fn mark_failed_with_class_str(
        &self,
        row: &DelegationRow,
        class: &str,
        message: &str,
    ) -> Result<(), ApiError> {
        let conn = self.hub.lock_conn();
        conn.execute(
            r#"UPDATE delegations
               SET status = 'failed', failure_class = NULLIF(?1, ''), last_error = ?2,
                   heartbeat_at_epoch = NULL, updated_at_epoch = ?3
               WHERE delegation_id = ?4"#,
            rusqlite::params![class, message, now_epoch(), row.delegation_id],
        )?;
        Ok(())
    }

    fn cancel(&self, row: &DelegationRow, message: &str) -> Result<(), ApiError> {
        self.refund_escrow(row)?;
        let conn = self.hub.lock_conn();
        conn.execute(
            r#"UPDATE delegations
               SET status = 'cancelled', last_error = ?1, heartbeat_at_epoch = NULL,
                   updated_at_epoch = ?2
               WHERE delegation_id = ?3"#,
            rusqlite::params![message, now_epoch(), row.delegation_id],
        )?;
        tracing::info!(delegation_id = %row.delegation_id, "delegation cancelled");
        Ok(())
    }
}

fn budget_state_label(ratio: f64) -> &'static str {
    if ratio >= 1.2 {
        "hard_stop"
    } else if ratio >= 1.0 {
        "reauthorization_required"
    } else if ratio >= 0.8 {
        "soft_alert"
    } else {
        "ok"
    }
}

/// Background reaper for stalled delegations.
pub fn spawn_reaper(engine: Arc<LifecycleEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match engine.reap_stale().await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "reclaimed stale delegations"),
                Err(err) => tracing::warn!(error = %err, "reaper pass failed"),
            }
        }
    })
}
