//! Authentication resolver and scope enforcement.
//!
//! Resolution pipeline, first match wins:
//! 1. `X-API-Key` — platform owner mapping from configuration
//! 2. `Authorization: AgentCredential <secret>` — HMAC hash lookup
//! 3. `X-Delegation-Token: <jti>.<signature>` — full-chain verification
//! 4. `Authorization: Bearer <token>` — HS256 scoped token
//!
//! Enforcement is fail-closed. In `warn` mode failures are logged and the
//! request proceeds as an anonymous platform principal (migration windows
//! only).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AccessMode;
use crate::error::ApiError;
use crate::state::AppState;

pub const DEFAULT_TENANT: &str = "tenant-default";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    AgentCredential,
    DelegationToken,
    Bearer,
    Anonymous,
}

/// The resolved caller identity attached to every authenticated request.
#[derive(Clone, Debug, Serialize)]
pub struct Principal {
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub scopes: Vec<String>,
    pub auth_method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub tenant_id: String,
}

impl Principal {
    /// API-key principals (and warn-mode anonymous ones) carry platform
    /// authority; scope checks apply to delegated and bearer principals.
    fn has_platform_authority(&self) -> bool {
        matches!(self.auth_method, AuthMethod::ApiKey | AuthMethod::Anonymous)
    }
}

/// Claims of a scoped bearer token (HS256).
#[derive(Debug, Serialize, Deserialize)]
pub struct BearerClaims {
    pub sub: String,
    pub agent_id: String,
    #[serde(default)]
    pub scope: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Issue a scoped bearer token signed with the bearer secret.
pub fn issue_bearer_token(
    secret: &str,
    subject: &str,
    agent_id: &str,
    scopes: &[String],
    ttl_seconds: i64,
) -> Result<(String, BearerClaims), ApiError> {
    let now = chrono::Utc::now().timestamp();
    let ttl = agenthub_identity::clamp_ttl(ttl_seconds);
    let claims = BearerClaims {
        sub: subject.to_string(),
        agent_id: agent_id.to_string(),
        scope: agenthub_identity::normalize_scopes(scopes.iter()).join(" "),
        iat: now,
        exp: now + ttl,
        jti: uuid::Uuid::new_v4().to_string(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("bearer token encoding failed: {e}")))?;
    Ok((token, claims))
}

/// Verify a scoped bearer token's signature and TTL.
pub fn verify_bearer_token(secret: &str, token: &str) -> Result<BearerClaims, ApiError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    decode::<BearerClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| ApiError::unauthorized("auth.invalid_bearer_token", format!("invalid bearer token: {e}")))
}

fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn tenant_id(req: &Request<Body>) -> String {
    header_str(req, "x-tenant-id")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_TENANT.to_string())
}

fn resolve(state: &AppState, req: &Request<Body>) -> Result<Principal, ApiError> {
    let tenant = tenant_id(req);

    if let Some(api_key) = header_str(req, "x-api-key") {
        let owner = state
            .config
            .api_keys
            .get(api_key)
            .ok_or_else(|| ApiError::unauthorized("auth.invalid_api_key", "missing or invalid API key"))?;
        return Ok(Principal {
            owner: owner.clone(),
            agent_id: None,
            scopes: vec![agenthub_identity::WILDCARD_SCOPE.to_string()],
            auth_method: AuthMethod::ApiKey,
            token_id: None,
            tenant_id: tenant,
        });
    }

    if let Some(auth) = header_str(req, "authorization") {
        if let Some(secret) = strip_scheme(auth, "AgentCredential ") {
            let verification = state.credentials.verify(secret).map_err(auth_error)?;
            let identity = state
                .identity_db
                .get_identity(&verification.agent_id)
                .map_err(auth_error)?;
            return Ok(Principal {
                owner: identity.owner,
                agent_id: Some(verification.agent_id),
                scopes: verification.scopes,
                auth_method: AuthMethod::AgentCredential,
                token_id: Some(verification.credential_id),
                tenant_id: tenant,
            });
        }
    }

    if let Some(signed_token) = header_str(req, "x-delegation-token") {
        let verification = state.tokens.verify(signed_token).map_err(auth_error)?;
        let identity = state
            .identity_db
            .get_identity(&verification.subject_agent_id)
            .map_err(auth_error)?;
        return Ok(Principal {
            owner: identity.owner,
            agent_id: Some(verification.subject_agent_id),
            scopes: verification.effective_scopes,
            auth_method: AuthMethod::DelegationToken,
            token_id: Some(verification.token_id),
            tenant_id: tenant,
        });
    }

    if let Some(auth) = header_str(req, "authorization") {
        if let Some(token) = strip_scheme(auth, "Bearer ") {
            let claims = verify_bearer_token(&state.config.bearer_signing_secret, token)?;
            return Ok(Principal {
                owner: claims.sub,
                agent_id: Some(claims.agent_id),
                scopes: claims
                    .scope
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                auth_method: AuthMethod::Bearer,
                token_id: Some(claims.jti),
                tenant_id: tenant,
            });
        }
    }

    Err(ApiError::unauthorized(
        "auth.missing_credentials",
        "missing or malformed authentication",
    ))
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    if header.len() > scheme.len() && header[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(header[scheme.len()..].trim())
    } else {
        None
    }
}

/// Map identity-layer failures onto the auth error space.
fn auth_error(err: agenthub_identity::Error) -> ApiError {
    use agenthub_identity::Error as E;
    match &err {
        E::IdentityInactive { status, .. } => {
            ApiError::unauthorized(format!("identity.{status}"), "identity is not active")
        }
        E::NotFound(_) => ApiError::unauthorized("auth.invalid_credential", "unknown principal"),
        _ => err.into(),
    }
}

/// The delegation scope a route requires from non-platform principals.
fn required_scope(method: &Method, path: &str) -> Option<&'static str> {
    if path.starts_with("/v1/delegations") || path.starts_with("/v1/identity/delegation-tokens") {
        return match *method {
            Method::GET => Some("read"),
            _ => Some("delegation.create"),
        };
    }
    if path.starts_with("/v1/identity") || path.starts_with("/v1/tokens") {
        return match *method {
            Method::GET => Some("read"),
            _ => Some("write"),
        };
    }
    match *method {
        Method::GET => Some("read"),
        _ => Some("write"),
    }
}

/// Middleware: resolve the caller and attach a [`Principal`] extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = match resolve(&state, &req) {
        Ok(principal) => principal,
        Err(err) => match state.config.access_mode {
            AccessMode::Enforce => return Err(err),
            AccessMode::Warn => {
                tracing::warn!(
                    method = %req.method(),
                    path = %req.uri().path(),
                    error = %err,
                    "auth failure allowed through (warn mode)"
                );
                Principal {
                    owner: "anonymous".to_string(),
                    agent_id: None,
                    scopes: vec![agenthub_identity::WILDCARD_SCOPE.to_string()],
                    auth_method: AuthMethod::Anonymous,
                    token_id: None,
                    tenant_id: tenant_id(&req),
                }
            }
        },
    };

    if !principal.has_platform_authority() {
        if let Some(scope) = required_scope(req.method(), req.uri().path()) {
            if !agenthub_identity::has_scope(&principal.scopes, scope) {
                if state.config.access_mode == AccessMode::Enforce {
                    return Err(ApiError::Forbidden {
                        code: "policy.insufficient_scope".to_string(),
                        message: format!("scope {scope} required"),
                        fields: Some(serde_json::json!({
                            "required_scope": scope,
                            "granted_scopes": principal.scopes,
                        })),
                    });
                }
                tracing::warn!(
                    path = %req.uri().path(),
                    required = scope,
                    "scope failure allowed through (warn mode)"
                );
            }
        }
    }

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Extract the principal attached by [`require_auth`].
pub fn principal(req_extensions: &axum::http::Extensions) -> Result<Principal, ApiError> {
    req_extensions
        .get::<Principal>()
        .cloned()
        .ok_or_else(|| ApiError::unauthorized("auth.missing_credentials", "unauthenticated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_round_trip() {
        let (token, claims) = issue_bearer_token(
            "bearer-secret",
            "owner-dev",
            "agt-a",
            &["read".to_string(), "write".to_string()],
            3600,
        )
        .unwrap();
        let verified = verify_bearer_token("bearer-secret", &token).unwrap();
        assert_eq!(verified.agent_id, "agt-a");
        assert_eq!(verified.scope, "read write");
        assert_eq!(verified.jti, claims.jti);
    }

    #[test]
    fn bearer_wrong_secret_rejected() {
        let (token, _) =
            issue_bearer_token("bearer-secret", "owner-dev", "agt-a", &[], 3600).unwrap();
        assert!(verify_bearer_token("other-secret", &token).is_err());
    }

    #[test]
    fn scheme_matching_is_case_insensitive() {
        assert_eq!(strip_scheme("Bearer tok", "Bearer "), Some("tok"));
        assert_eq!(strip_scheme("bearer tok", "Bearer "), Some("tok"));
        assert_eq!(
            strip_scheme("agentcredential sec", "AgentCredential "),
            Some("sec")
        );
        assert_eq!(strip_scheme("Basic zzz", "Bearer "), None);
        assert_eq!(strip_scheme("Bearer", "Bearer "), None);
    }

    #[test]
    fn route_scope_map() {
        assert_eq!(
            required_scope(&Method::POST, "/v1/delegations"),
            Some("delegation.create")
        );
        assert_eq!(
            required_scope(&Method::POST, "/v1/identity/delegation-tokens"),
            Some("delegation.create")
        );
        assert_eq!(
            required_scope(&Method::POST, "/v1/identity/agents"),
            Some("write")
        );
        assert_eq!(
            required_scope(&Method::GET, "/v1/identity/agents/x"),
            Some("read")
        );
    }
}
