//! Per-token budget governance: the 80/100/120 threshold state machine.
//!
//! Spend accrues as budget events against a delegation token. Event
//! insertion and ratio re-evaluation happen inside one transaction so
//! concurrent writers cannot race past `hard_stop`, and the observed state
//! for a token is monotone: ok -> soft_alert -> reauthorization_required ->
//! hard_stop.

use std::sync::Arc;

use rusqlite::OptionalExtension;
use serde::Serialize;
use uuid::Uuid;

use crate::db::{now_epoch, HubDb};
use crate::error::ApiError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    Ok,
    SoftAlert,
    ReauthorizationRequired,
    HardStop,
}

impl BudgetState {
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.2 {
            BudgetState::HardStop
        } else if ratio >= 1.0 {
            BudgetState::ReauthorizationRequired
        } else if ratio >= 0.8 {
            BudgetState::SoftAlert
        } else {
            BudgetState::Ok
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BudgetStatus {
    pub token_id: String,
    pub state: BudgetState,
    pub total_spend_usd: f64,
    pub max_budget_usd: f64,
    pub spend_ratio: f64,
    pub thresholds: BudgetThresholds,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct BudgetThresholds {
    pub soft_alert: f64,
    pub reauthorization: f64,
    pub hard_stop: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            soft_alert: 0.8,
            reauthorization: 1.0,
            hard_stop: 1.2,
        }
    }
}

pub struct BudgetStore {
    db: Arc<HubDb>,
}

impl BudgetStore {
    pub fn new(db: Arc<HubDb>) -> Self {
        Self { db }
    }

    /// Attach (or replace) the budget limit for a delegation token.
    pub fn set_limit(
        &self,
        token_id: &str,
        tenant_id: &str,
        max_budget_usd: f64,
    ) -> Result<(), ApiError> {
        if max_budget_usd <= 0.0 {
            return Err(ApiError::validation("max_budget_usd must be positive"));
        }
        let conn = self.db.lock_conn();
        conn.execute(
            r#"INSERT OR REPLACE INTO budget_limits(
                   token_id, tenant_id, max_budget_usd, created_at_epoch
               ) VALUES (?1, ?2, ?3, ?4)"#,
            rusqlite::params![token_id, tenant_id, max_budget_usd, now_epoch()],
        )?;
        Ok(())
    }

    /// Record a cost event. Rejected with `402 budget.hard_stop` when the
    /// token is already at or past the hard-stop threshold; the check and
    /// the insert share one transaction.
    pub fn record_event(
        &self,
        token_id: &str,
        tenant_id: &str,
        actor: &str,
        cost_usd: f64,
        description: &str,
    ) -> Result<BudgetStatus, ApiError> {
        if cost_usd.is_nan() || cost_usd < 0.0 {
            return Err(ApiError::validation("cost_usd must be >= 0"));
        }

        let mut conn = self.db.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let max_budget = Self::max_budget(&tx, token_id)?.ok_or_else(|| {
            ApiError::not_found(format!("no budget limit for token: {token_id}"))
        })?;

        let before = Self::total_spend(&tx, token_id)?;
        let status_before = Self::status_from(token_id, before, max_budget);
        if status_before.state == BudgetState::HardStop {
            return Err(hard_stop_error(&status_before));
        }

        tx.execute(
            r#"INSERT INTO budget_events(
                   event_id, token_id, tenant_id, actor, cost_usd, description, created_at_epoch
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            rusqlite::params![
                Uuid::new_v4().to_string(),
                token_id,
                tenant_id,
                actor,
                cost_usd,
                description,
                now_epoch(),
            ],
        )?;

        let after = Self::total_spend(&tx, token_id)?;
        tx.commit()?;

        Ok(Self::status_from(token_id, after, max_budget))
    }

    /// Evaluate the current state of a token's budget.
    pub fn evaluate(&self, token_id: &str) -> Result<BudgetStatus, ApiError> {
        let conn = self.db.lock_conn();
        let max_budget = Self::max_budget(&conn, token_id)?.ok_or_else(|| {
            ApiError::not_found(format!("no budget limit for token: {token_id}"))
        })?;
        let total = Self::total_spend(&conn, token_id)?;
        Ok(Self::status_from(token_id, total, max_budget))
    }

    /// Reject with `402 budget.hard_stop` when the token has crossed the
    /// hard threshold (cost-bearing call gate).
    pub fn enforce(&self, token_id: &str) -> Result<BudgetStatus, ApiError> {
        let status = self.evaluate(token_id)?;
        if status.state == BudgetState::HardStop {
            return Err(hard_stop_error(&status));
        }
        Ok(status)
    }

    fn max_budget(conn: &rusqlite::Connection, token_id: &str) -> Result<Option<f64>, ApiError> {
        Ok(conn
            .query_row(
                "SELECT max_budget_usd FROM budget_limits WHERE token_id = ?1",
                [token_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn total_spend(conn: &rusqlite::Connection, token_id: &str) -> Result<f64, ApiError> {
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM budget_events WHERE token_id = ?1",
            [token_id],
            |row| row.get(0),
        )?)
    }

    fn status_from(token_id: &str, total: f64, max_budget: f64) -> BudgetStatus {
        let ratio = if max_budget > 0.0 {
            total / max_budget
        } else {
            0.0
        };
        let spend_ratio = (ratio * 10_000.0).round() / 10_000.0;
        BudgetStatus {
            token_id: token_id.to_string(),
            state: BudgetState::from_ratio(spend_ratio),
            total_spend_usd: total,
            max_budget_usd: max_budget,
            spend_ratio,
            thresholds: BudgetThresholds::default(),
        }
    }
}

fn hard_stop_error(status: &BudgetStatus) -> ApiError {
    ApiError::PaymentRequired {
        code: "budget.hard_stop",
        message: format!(
            "delegation budget exceeded hard stop: {:.2} / {:.2} USD",
            status.total_spend_usd, status.max_budget_usd
        ),
        fields: Some(serde_json::json!({
            "spend_ratio": status.spend_ratio,
            "total_spend_usd": status.total_spend_usd,
            "max_budget_usd": status.max_budget_usd,
        })),
    }
}
