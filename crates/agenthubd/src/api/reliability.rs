//! Reliability SLO dashboard and breaker operator routes.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::reliability::DEFAULT_WINDOW_SIZE;
use crate::state::AppState;

use super::run_idempotent;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/reliability/slo-dashboard", get(slo_dashboard))
        .route("/v1/reliability/breaker/reset", post(reset_breaker))
}

#[derive(Debug, Deserialize)]
struct DashboardQuery {
    #[serde(default)]
    window_size: Option<usize>,
}

async fn slo_dashboard(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dashboard = state
        .reliability
        .build_dashboard(query.window_size.unwrap_or(DEFAULT_WINDOW_SIZE))?;
    Ok(Json(serde_json::to_value(dashboard)?))
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ResetBreakerRequest {}

async fn reset_breaker(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(body): Json<ResetBreakerRequest>,
) -> Result<axum::response::Response, ApiError> {
    if !state.config.is_admin_owner(&principal.owner) {
        return Err(ApiError::forbidden(
            "policy.admin_required",
            "breaker reset requires an admin owner",
        ));
    }

    let request_body = serde_json::to_value(body)?;
    let state_inner = state.clone();
    run_idempotent(
        &state,
        &principal,
        "POST",
        "/v1/reliability/breaker/reset",
        &headers,
        &request_body,
        move || async move {
            state_inner.reliability.reset()?;
            Ok((
                StatusCode::OK,
                serde_json::json!({ "circuit_breaker": { "state": "closed" } }),
            ))
        },
    )
    .await
}
