//! Agent identity, credential and revocation routes.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

use super::run_idempotent;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/identity/agents", post(register_agent))
        .route("/v1/identity/agents/{agent_id}", get(get_agent))
        .route("/v1/identity/agents/{agent_id}", patch(update_agent_status))
        .route(
            "/v1/identity/agents/{agent_id}/credentials",
            post(issue_credential),
        )
        .route(
            "/v1/identity/agents/{agent_id}/active-sessions",
            get(active_sessions),
        )
        .route(
            "/v1/identity/credentials/{credential_id}",
            get(credential_metadata),
        )
        .route(
            "/v1/identity/credentials/{credential_id}/rotate",
            post(rotate_credential),
        )
        .route(
            "/v1/identity/credentials/{credential_id}/revoke",
            post(revoke_credential),
        )
        .route("/v1/identity/agents/{agent_id}/revoke", post(revoke_agent))
        .route("/v1/identity/revocations/bulk", post(bulk_revoke))
        .route("/v1/identity/revocations", get(list_revocations))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterAgentRequest {
    agent_id: String,
    credential_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    human_principal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    configuration_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

async fn register_agent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    run_idempotent(
        &state,
        &principal,
        "POST",
        "/v1/identity/agents",
        &headers,
        &body,
        move || async move {
            if req.agent_id.trim().is_empty() {
                return Err(ApiError::validation("agent_id must not be empty"));
            }
            let credential_type =
                agenthub_identity::CredentialType::parse(&req.credential_type).map_err(|_| {
                    ApiError::Validation {
                        code: "identity.invalid_credential_type",
                        message: format!(
                            "invalid credential_type: {} (expected api_key, jwt, spiffe or mtls)",
                            req.credential_type
                        ),
                        fields: None,
                    }
                })?;
            let identity = state_inner.identity_db.register_identity(
                req.agent_id.trim(),
                &owner,
                credential_type,
                req.public_key_pem.as_deref(),
                req.human_principal_id.as_deref(),
                req.configuration_checksum.as_deref(),
                &req.metadata,
            )?;
            Ok((StatusCode::OK, serde_json::to_value(identity)?))
        },
    )
    .await
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = state.identity_db.get_identity(&agent_id)?;
    Ok(Json(serde_json::to_value(identity)?))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateAgentStatusRequest {
    status: String,
}

async fn update_agent_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateAgentStatusRequest>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    let route = format!("/v1/identity/agents/{agent_id}");
    run_idempotent(
        &state,
        &principal,
        "PATCH",
        &route,
        &headers,
        &body,
        move || async move {
            let identity = state_inner.identity_db.get_identity(&agent_id)?;
            if identity.owner != owner {
                return Err(ApiError::forbidden("identity.owner_mismatch", "owner mismatch"));
            }
            let status = agenthub_identity::IdentityStatus::parse(&req.status)
                .map_err(|e| ApiError::validation(e.to_string()))?;
            let updated = state_inner
                .identity_db
                .update_identity_status(&agent_id, status)?;
            Ok((StatusCode::OK, serde_json::to_value(updated)?))
        },
    )
    .await
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueCredentialRequest {
    scopes: Vec<String>,
    #[serde(default = "default_ttl")]
    ttl_seconds: i64,
}

fn default_ttl() -> i64 {
    agenthub_identity::DEFAULT_TTL_SECONDS
}

/// Token issuance: naturally idempotent, exempt from `Idempotency-Key`.
/// The plaintext secret appears in this response and nowhere else, ever.
async fn issue_credential(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(agent_id): Path<String>,
    Json(req): Json<IssueCredentialRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let issued =
        state
            .credentials
            .issue(&agent_id, &req.scopes, req.ttl_seconds, &principal.owner)?;
    Ok(Json(serde_json::to_value(issued)?))
}

async fn active_sessions(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.identity_db.get_identity(&agent_id)?;
    let credentials = state.identity_db.list_active_credentials(&agent_id)?;
    Ok(Json(serde_json::json!({
        "agent_id": agent_id,
        "active_credentials": credentials.len(),
        "credentials": credentials,
    })))
}

async fn credential_metadata(
    State(state): State<AppState>,
    Path(credential_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let credential = state.identity_db.get_credential(&credential_id)?;
    Ok(Json(serde_json::to_value(credential)?))
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RotateCredentialRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_scopes: Option<Vec<String>>,
    #[serde(default = "default_ttl")]
    new_ttl_seconds: i64,
}

async fn rotate_credential(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(credential_id): Path<String>,
    Json(req): Json<RotateCredentialRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let issued = state.credentials.rotate(
        &credential_id,
        &principal.owner,
        req.new_scopes.as_deref(),
        req.new_ttl_seconds,
    )?;
    let mut value = serde_json::to_value(issued)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "rotated_from".to_string(),
            serde_json::Value::String(credential_id),
        );
    }
    Ok(Json(value))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RevokeCredentialRequest {
    #[serde(default = "default_reason")]
    reason: String,
}

fn default_reason() -> String {
    "manual_revocation".to_string()
}

async fn revoke_credential(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(credential_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RevokeCredentialRequest>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    let route = format!("/v1/identity/credentials/{credential_id}/revoke");
    run_idempotent(
        &state,
        &principal,
        "POST",
        &route,
        &headers,
        &body,
        move || async move {
            let credential =
                state_inner
                    .credentials
                    .revoke(&credential_id, &owner, &req.reason)?;
            Ok((StatusCode::OK, serde_json::to_value(credential)?))
        },
    )
    .await
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RevokeAgentRequest {
    #[serde(default = "default_reason")]
    reason: String,
}

/// Kill switch: cascade revocation of an identity, its credentials, its
/// delegation tokens, and any in-flight delegations it touches.
async fn revoke_agent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RevokeAgentRequest>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    let route = format!("/v1/identity/agents/{agent_id}/revoke");
    run_idempotent(
        &state,
        &principal,
        "POST",
        &route,
        &headers,
        &body,
        move || async move {
            let cancelled = state_inner.lifecycle.flag_cancellations_for_agent(&agent_id)?;
            let outcome =
                state_inner
                    .revocation
                    .revoke_agent(&agent_id, &owner, &req.reason, cancelled)?;
            crate::outbox::enqueue(
                &state_inner.hub,
                "identity.revocation",
                &serde_json::to_value(&outcome)?,
            )?;
            Ok((StatusCode::OK, serde_json::to_value(outcome)?))
        },
    )
    .await
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BulkRevokeRequest {
    agent_ids: Vec<String>,
    #[serde(default = "default_bulk_reason")]
    reason: String,
}

fn default_bulk_reason() -> String {
    "security_incident".to_string()
}

async fn bulk_revoke(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(req): Json<BulkRevokeRequest>,
) -> Result<axum::response::Response, ApiError> {
    if req.agent_ids.is_empty() || req.agent_ids.len() > 100 {
        return Err(ApiError::validation("agent_ids must contain 1..=100 entries"));
    }
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    run_idempotent(
        &state,
        &principal,
        "POST",
        "/v1/identity/revocations/bulk",
        &headers,
        &body,
        move || async move {
            let mut results = Vec::new();
            let mut total_revoked = 0usize;
            for agent_id in &req.agent_ids {
                let cancelled = state_inner.lifecycle.flag_cancellations_for_agent(agent_id)?;
                match state_inner
                    .revocation
                    .revoke_agent(agent_id, &owner, &req.reason, cancelled)
                {
                    Ok(outcome) => {
                        total_revoked += 1;
                        results.push(serde_json::to_value(outcome)?);
                    }
                    Err(err) => results.push(serde_json::json!({
                        "agent_id": agent_id,
                        "error": err.to_string(),
                    })),
                }
            }
            Ok((
                StatusCode::OK,
                serde_json::json!({
                    "total_requested": req.agent_ids.len(),
                    "total_revoked": total_revoked,
                    "results": results,
                }),
            ))
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
struct RevocationsQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_revocations(
    State(state): State<AppState>,
    axum::extract::Query(query): axum::extract::Query<RevocationsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state
        .revocation
        .list_events(query.agent_id.as_deref(), query.limit.clamp(1, 1000))?;
    Ok(Json(serde_json::json!({ "events": events })))
}
