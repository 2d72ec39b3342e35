//! SQLite-backed hub state: idempotency reservations, delegation lifecycle
//! rows, escrow balances, budget governance, breaker state, outbox.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::ApiError;

pub(crate) const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_requests (
    tenant_id TEXT NOT NULL,
    actor TEXT NOT NULL,
    method TEXT NOT NULL,
    route TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    http_status INTEGER,
    content_type TEXT,
    headers_json TEXT,
    response_body_b64 TEXT,
    created_at_epoch INTEGER NOT NULL,
    updated_at_epoch INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, actor, method, route, idempotency_key)
);

CREATE TABLE IF NOT EXISTS delegations (
    delegation_id TEXT PRIMARY KEY,
    requester_agent_id TEXT NOT NULL,
    delegate_agent_id TEXT NOT NULL,
    task_spec TEXT NOT NULL,
    estimated_cost_usd REAL NOT NULL,
    actual_cost_usd REAL,
    max_budget_usd REAL NOT NULL,
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    failure_class TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    latency_ms REAL,
    lifecycle_json TEXT NOT NULL DEFAULT '[]',
    policy_decision_json TEXT,
    simulated_actual_cost_usd REAL,
    simulated_failure_class TEXT,
    auto_reauthorize INTEGER NOT NULL DEFAULT 1,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    heartbeat_at_epoch INTEGER,
    created_at_epoch INTEGER NOT NULL,
    updated_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delegations_status ON delegations(status, heartbeat_at_epoch);
CREATE INDEX IF NOT EXISTS idx_delegations_created ON delegations(created_at_epoch DESC);
CREATE INDEX IF NOT EXISTS idx_delegations_agents ON delegations(requester_agent_id, delegate_agent_id);

CREATE TABLE IF NOT EXISTS delegation_balances (
    agent_id TEXT PRIMARY KEY,
    balance_usd REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS budget_limits (
    token_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    max_budget_usd REAL NOT NULL,
    soft_alert_ratio REAL NOT NULL DEFAULT 0.8,
    reauth_ratio REAL NOT NULL DEFAULT 1.0,
    hard_stop_ratio REAL NOT NULL DEFAULT 1.2,
    created_at_epoch INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS budget_events (
    event_id TEXT PRIMARY KEY,
    token_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    actor TEXT NOT NULL,
    cost_usd REAL NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at_epoch INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_budget_events_token ON budget_events(token_id);

CREATE TABLE IF NOT EXISTS breaker_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL,
    reset_at_epoch INTEGER,
    updated_at_epoch INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox_events (
    event_id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at_epoch INTEGER NOT NULL,
    dispatched_at_epoch INTEGER
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox_events(dispatched_at_epoch, created_at_epoch);
"#;

pub struct HubDb {
    conn: Mutex<Connection>,
}

impl HubDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ApiError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::Internal(format!("cannot create db directory: {e}")))?;
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

    pub fn in_memory() -> Result<Self, ApiError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }
}

pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
