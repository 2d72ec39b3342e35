//! HTTP surface: route composition and the request-scoped middleware
//! (request-id logging, request timeout, authentication, idempotency).

pub mod delegations;
pub mod federation;
pub mod identity;
pub mod reliability;
pub mod system;
pub mod tokens;

use std::future::Future;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, Principal};
use crate::error::ApiError;
use crate::idempotency::{IdempotencyScope, Reservation, REPLAY_HEADER};
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/healthz", get(system::healthz));

    let v1 = Router::new()
        .merge(identity::router())
        .merge(tokens::router())
        .merge(federation::router())
        .merge(delegations::router())
        .merge(reliability::router())
        .merge(system::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(v1)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            timeout_middleware,
        ))
        .layer(middleware::from_fn(request_meta))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Return 504 when request processing exceeds the configured budget. The
/// caller's idempotency reservation goes stale and is reclaimed on retry.
async fn timeout_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.uri().path() == "/healthz" {
        return Ok(next.run(req).await);
    }
    let budget = Duration::from_secs(state.config.request_timeout_seconds);
    tokio::time::timeout(budget, next.run(req))
        .await
        .map_err(|_| ApiError::Timeout)
}

/// Inject `X-Request-ID` and log request/response metadata.
async fn request_meta(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..16].to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert("x-request-id", value);
    }

    let start = std::time::Instant::now();
    let mut response = next.run(req).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    let status = response.status().as_u16();
    if status >= 500 {
        tracing::error!(%request_id, %method, %path, status, duration_ms, "request completed");
    } else if status >= 400 {
        tracing::warn!(%request_id, %method, %path, status, duration_ms, "request completed");
    } else {
        tracing::info!(%request_id, %method, %path, status, duration_ms, "request completed");
    }
    response
}

/// Extract the mandatory `Idempotency-Key` header.
pub(crate) fn require_idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::Validation {
            code: "schema.idempotency_key_required",
            message: "missing Idempotency-Key header".to_string(),
            fields: None,
        })
}

/// Canonical request hash binding an idempotency key to its payload.
pub(crate) fn request_hash(body: &serde_json::Value) -> String {
    match agenthub_core::canonical::canonical_bytes(body) {
        Ok(bytes) => agenthub_core::sha256_hex(&bytes),
        Err(_) => agenthub_core::sha256_hex(body.to_string().as_bytes()),
    }
}

/// Run a mutating handler under an idempotency reservation: the first call
/// executes and caches its response; identical retries replay the cached
/// bytes with the replay header; payload mismatches conflict.
pub(crate) async fn run_idempotent<F, Fut>(
    state: &AppState,
    principal: &Principal,
    method: &str,
    route: &str,
    headers: &HeaderMap,
    request_body: &serde_json::Value,
    f: F,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, serde_json::Value), ApiError>>,
{
    let key = require_idempotency_key(headers)?;
    let scope = IdempotencyScope {
        tenant_id: principal.tenant_id.clone(),
        actor: principal.owner.clone(),
        method: method.to_string(),
        route: route.to_string(),
        idempotency_key: key,
    };
    let hash = request_hash(request_body);

    match state.idempotency.reserve(&scope, &hash)? {
        Reservation::Conflict => Err(ApiError::Conflict {
            code: "idempotency.key_reused_with_different_payload",
            message: "idempotency key replay with different request payload".to_string(),
        }),
        Reservation::InProgress => Err(ApiError::Conflict {
            code: "idempotency.in_progress",
            message: "idempotency key request already in progress".to_string(),
        }),
        Reservation::Replay(cached) => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(cached.http_status).unwrap_or(StatusCode::OK))
                .header(header::CONTENT_TYPE, cached.content_type.clone())
                .header(REPLAY_HEADER, "true");
            for (name, value) in &cached.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder
                .body(Body::from(cached.body))
                .map_err(|e| ApiError::Internal(format!("replay response build failed: {e}")))
        }
        Reservation::New => match f().await {
            Ok((status, body)) => {
                let bytes = serde_json::to_vec(&body)?;
                state.idempotency.finalize(
                    &scope,
                    status.as_u16(),
                    "application/json",
                    &Default::default(),
                    &bytes,
                )?;
                Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))
                    .map_err(|e| ApiError::Internal(format!("response build failed: {e}")))
            }
            Err(err) => {
                state.idempotency.fail(&scope)?;
                Err(err)
            }
        },
    }
}
