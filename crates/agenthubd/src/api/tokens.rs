//! Delegation token and scoped bearer token routes.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::{self, Principal};
use crate::error::ApiError;
use crate::state::AppState;

use super::run_idempotent;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/identity/delegation-tokens", post(issue_token))
        .route("/v1/identity/delegation-tokens/verify", post(verify_token))
        .route(
            "/v1/identity/delegation-tokens/{token_id}/chain",
            get(token_chain),
        )
        .route(
            "/v1/identity/delegation-tokens/{token_id}/revoke",
            post(revoke_token),
        )
        .route("/v1/tokens/jwt", post(issue_jwt))
        .route("/v1/tokens/jwt/verify", post(verify_jwt))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueTokenRequest {
    issuer_agent_id: String,
    subject_agent_id: String,
    delegated_scopes: Vec<String>,
    #[serde(default = "default_ttl")]
    ttl_seconds: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_token_id: Option<String>,
    /// Attaches a budget limit to the minted token (cost governance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_budget_usd: Option<f64>,
}

fn default_ttl() -> i64 {
    agenthub_identity::DEFAULT_TTL_SECONDS
}

/// Token issuance: naturally idempotent, exempt from `Idempotency-Key`.
/// The signed token is the only bearer secret and is never re-readable.
async fn issue_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let issued = state.tokens.issue(
        &agenthub_identity::IssueTokenRequest {
            issuer_agent_id: req.issuer_agent_id.clone(),
            subject_agent_id: req.subject_agent_id.clone(),
            delegated_scopes: req.delegated_scopes.clone(),
            ttl_seconds: req.ttl_seconds,
            parent_token_id: req.parent_token_id.clone(),
        },
        &principal.owner,
    )?;

    if let Some(max_budget_usd) = req.max_budget_usd {
        state
            .budget
            .set_limit(&issued.token_id, &principal.tenant_id, max_budget_usd)?;
    }

    Ok(Json(serde_json::to_value(issued)?))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyTokenRequest {
    signed_token: String,
}

async fn verify_token(
    State(state): State<AppState>,
    Json(req): Json<VerifyTokenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let verification = state
        .tokens
        .verify(&req.signed_token)
        .map_err(verification_error)?;
    let chain = state.tokens.chain(&verification.token_id)?;
    let mut value = serde_json::to_value(&verification)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("chain".to_string(), serde_json::to_value(chain)?);
    }
    Ok(Json(value))
}

/// Verification failures surface as 401 with the revocation/chain codes.
fn verification_error(err: agenthub_identity::Error) -> ApiError {
    use agenthub_identity::Error as E;
    match &err {
        E::Revoked => ApiError::unauthorized("identity.revoked", "delegation token is revoked"),
        E::Expired => ApiError::unauthorized("identity.expired", "delegation token expired"),
        E::CredentialInvalid | E::NotFound(_) => {
            ApiError::unauthorized("delegation.chain_invalid", "delegation token not found")
        }
        _ => err.into(),
    }
}

async fn token_chain(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chain = state.tokens.chain(&token_id)?;
    let effective_scopes = chain
        .last()
        .map(|link| link.delegated_scopes.clone())
        .unwrap_or_default();
    let chain_depth = chain.last().map(|link| link.chain_depth).unwrap_or(0);
    Ok(Json(serde_json::json!({
        "token_id": token_id,
        "chain": chain,
        "chain_depth": chain_depth,
        "effective_scopes": effective_scopes,
    })))
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RevokeTokenRequest {}

async fn revoke_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(token_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<RevokeTokenRequest>,
) -> Result<axum::response::Response, ApiError> {
    let request_body = serde_json::to_value(body)?;
    let state_inner = state.clone();
    let owner = principal.owner.clone();
    let route = format!("/v1/identity/delegation-tokens/{token_id}/revoke");
    run_idempotent(
        &state,
        &principal,
        "POST",
        &route,
        &headers,
        &request_body,
        move || async move {
            let cascade = state_inner.tokens.revoke(&token_id, &owner)?;
            Ok((
                StatusCode::OK,
                serde_json::json!({
                    "token_id": token_id,
                    "revoked": true,
                    "cascade_count": cascade,
                }),
            ))
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueJwtRequest {
    agent_id: String,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default = "default_ttl")]
    ttl_seconds: i64,
}

/// Scoped bearer token issuance (HS256). Exempt from `Idempotency-Key` for
/// the same reason credential issuance is.
async fn issue_jwt(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<IssueJwtRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let identity = state.identity_db.require_active_identity(&req.agent_id)?;
    if identity.owner != principal.owner {
        return Err(ApiError::forbidden("identity.owner_mismatch", "owner mismatch"));
    }

    let (token, claims) = auth::issue_bearer_token(
        &state.config.bearer_signing_secret,
        &principal.owner,
        &req.agent_id,
        &req.scopes,
        req.ttl_seconds,
    )?;
    Ok(Json(serde_json::json!({
        "token": token,
        "token_type": "Bearer",
        "agent_id": claims.agent_id,
        "scope": claims.scope,
        "expires_at": agenthub_identity::iso_from_epoch(claims.exp),
        "jti": claims.jti,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyJwtRequest {
    token: String,
}

async fn verify_jwt(
    State(state): State<AppState>,
    Json(req): Json<VerifyJwtRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = auth::verify_bearer_token(&state.config.bearer_signing_secret, &req.token)?;
    Ok(Json(serde_json::json!({
        "valid": true,
        "sub": claims.sub,
        "agent_id": claims.agent_id,
        "scope": claims.scope,
        "expires_at": agenthub_identity::iso_from_epoch(claims.exp),
        "jti": claims.jti,
    })))
}
