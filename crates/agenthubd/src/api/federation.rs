//! Federation trust registry routes.

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::error::ApiError;
use crate::state::AppState;

use super::run_idempotent;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/identity/trust-registry/domains", post(register_domain))
        .route("/v1/identity/trust-registry/domains", get(list_domains))
        .route(
            "/v1/identity/trust-registry/domains/{domain_id}",
            get(get_domain),
        )
        .route("/v1/identity/agents/{agent_id}/attest", post(attest_agent))
        .route(
            "/v1/identity/attestations/{attestation_id}/verify",
            get(verify_attestation),
        )
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterDomainRequest {
    domain_id: String,
    display_name: String,
    #[serde(default = "default_trust_level")]
    trust_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public_key_pem: Option<String>,
    #[serde(default)]
    allowed_scopes: Vec<String>,
}

fn default_trust_level() -> String {
    "verified".to_string()
}

async fn register_domain(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    Json(req): Json<RegisterDomainRequest>,
) -> Result<axum::response::Response, ApiError> {
    if !state.config.is_admin_owner(&principal.owner) {
        return Err(ApiError::forbidden(
            "policy.admin_required",
            "trust registry administration requires an admin owner",
        ));
    }

    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    run_idempotent(
        &state,
        &principal,
        "POST",
        "/v1/identity/trust-registry/domains",
        &headers,
        &body,
        move || async move {
            let trust_level = agenthub_identity::DomainTrustLevel::parse(&req.trust_level)
                .map_err(|e| ApiError::validation(e.to_string()))?;
            let domain = state_inner.federation.register_domain(
                &req.domain_id,
                &req.display_name,
                trust_level,
                req.public_key_pem.as_deref(),
                &req.allowed_scopes,
                &owner,
            )?;
            Ok((StatusCode::OK, serde_json::to_value(domain)?))
        },
    )
    .await
}

async fn list_domains(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let domains = state.federation.list_domains()?;
    Ok(Json(serde_json::json!({ "domains": domains })))
}

async fn get_domain(
    State(state): State<AppState>,
    Path(domain_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let domain = state.federation.get_domain(&domain_id)?;
    Ok(Json(serde_json::to_value(domain)?))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AttestAgentRequest {
    domain_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    claims: BTreeMap<String, String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default = "default_ttl")]
    ttl_seconds: i64,
}

fn default_ttl() -> i64 {
    agenthub_identity::DEFAULT_TTL_SECONDS
}

async fn attest_agent(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AttestAgentRequest>,
) -> Result<axum::response::Response, ApiError> {
    let body = serde_json::to_value(&req)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    let route = format!("/v1/identity/agents/{agent_id}/attest");
    run_idempotent(
        &state,
        &principal,
        "POST",
        &route,
        &headers,
        &body,
        move || async move {
            let attestation = state_inner.federation.attest(
                &agent_id,
                &req.domain_id,
                &req.claims,
                &req.scopes,
                req.ttl_seconds,
                &owner,
            )?;
            Ok((StatusCode::OK, serde_json::to_value(attestation)?))
        },
    )
    .await
}

async fn verify_attestation(
    State(state): State<AppState>,
    Path(attestation_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let verification = state
        .federation
        .verify(&attestation_id)
        .map_err(|err| match &err {
            agenthub_identity::Error::Expired => {
                ApiError::unauthorized("identity.expired", "attestation expired")
            }
            agenthub_identity::Error::Revoked => {
                ApiError::unauthorized("identity.revoked", "domain trust has been revoked")
            }
            agenthub_identity::Error::InvalidSignature => {
                ApiError::unauthorized("auth.invalid_signature", "invalid attestation signature")
            }
            _ => err.into(),
        })?;
    Ok(Json(serde_json::to_value(verification)?))
}
