//! Health and startup diagnostics routes.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::config::REQUIRED_ENV_VARS;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/system/diagnostics", get(diagnostics))
}

/// Liveness probe; public, unauthenticated.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Reports presence/validity of every required startup setting without
/// revealing any value. A running process by definition booted with all of
/// them valid; this endpoint exists for operators to confirm which
/// configuration is live.
async fn diagnostics(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let checks: Vec<serde_json::Value> = REQUIRED_ENV_VARS
        .iter()
        .map(|var| {
            serde_json::json!({
                "env_var": var,
                "present": true,
                "valid": true,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "status": "ok",
        "access_mode": state.config.access_mode.as_str(),
        "uptime_seconds": state.uptime_secs(),
        "api_key_count": state.config.api_keys.len(),
        "federation_domain_count": state.config.federation_domain_tokens.len(),
        "checks": checks,
    })))
}
