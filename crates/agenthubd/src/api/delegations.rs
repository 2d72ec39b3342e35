//! Delegation lifecycle and budget governance routes.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::lifecycle::{delegation_contract, CreateDelegation, RequestContext};
use crate::state::AppState;

use super::run_idempotent;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/delegations", post(create_delegation))
        .route("/v1/delegations/contract", get(contract))
        .route("/v1/delegations/{delegation_id}/status", get(delegation_status))
        .route("/v1/delegations/budget-events", post(record_budget_event))
        .route("/v1/delegations/budget/{token_id}", get(budget_status))
}

async fn create_delegation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(req): Json<CreateDelegation>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(serde_json::json!({
        "requester_agent_id": req.requester_agent_id,
        "delegate_agent_id": req.delegate_agent_id,
        "task_spec": req.task_spec,
        "estimated_cost_usd": req.estimated_cost_usd,
        "max_budget_usd": req.max_budget_usd,
        "simulated_actual_cost_usd": req.simulated_actual_cost_usd,
        "simulated_failure_class": req.simulated_failure_class,
        "auto_reauthorize": req.auto_reauthorize,
    }))?;

    let state_inner = state.clone();
    let ctx = RequestContext {
        owner: principal.owner.clone(),
        tenant_id: principal.tenant_id.clone(),
    };
    run_idempotent(
        &state,
        &principal,
        "POST",
        "/v1/delegations",
        &headers,
        &body,
        move || async move {
            // New work is gated while the breaker is open.
            if let Some(dashboard) = state_inner.reliability.gate_open()? {
                return Err(ApiError::BreakerOpen {
                    breaker: serde_json::to_value(&dashboard.circuit_breaker)?,
                    alerts: serde_json::to_value(&dashboard.alerts)?,
                });
            }

            let view = state_inner.lifecycle.create(&req, &ctx).await?;
            Ok((StatusCode::OK, serde_json::to_value(view)?))
        },
    )
    .await
}

async fn contract() -> Json<serde_json::Value> {
    Json(delegation_contract())
}

async fn delegation_status(
    State(state): State<AppState>,
    Path(delegation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let view = state.lifecycle.status(&delegation_id)?;
    let mut value = serde_json::to_value(view)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("contract".to_string(), delegation_contract());
    }
    Ok(Json(value))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BudgetEventRequest {
    token_id: String,
    cost_usd: f64,
    #[serde(default)]
    description: String,
}

/// Cost-bearing call: records spend against a delegation token's budget
/// and surfaces the resulting state. Soft alerts ride along as warnings;
/// a token past hard stop rejects with 402.
async fn record_budget_event(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(req): Json<BudgetEventRequest>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let actor = principal
        .agent_id
        .clone()
        .unwrap_or_else(|| principal.owner.clone());
    let tenant = principal.tenant_id.clone();
    run_idempotent(
        &state,
        &principal,
        "POST",
        "/v1/delegations/budget-events",
        &headers,
        &body,
        move || async move {
            let status = state_inner.budget.record_event(
                &req.token_id,
                &tenant,
                &actor,
                req.cost_usd,
                &req.description,
            )?;

            let mut value = serde_json::to_value(&status)?;
            if status.state == crate::budget::BudgetState::SoftAlert {
                if let Some(obj) = value.as_object_mut() {
                    obj.insert(
                        "warnings".to_string(),
                        serde_json::json!(["budget.soft_alert"]),
                    );
                }
            }
            Ok((StatusCode::OK, value))
        },
    )
    .await
}

async fn budget_status(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.budget.evaluate(&token_id)?;
    Ok(Json(serde_json::to_value(status)?))
}
