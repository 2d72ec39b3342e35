//! Shared harness: build the real router over in-memory stores and drive
//! it request-by-request.

#![allow(clippy::expect_used, clippy::unwrap_used, dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use agenthubd::config::Config;
use agenthubd::state::AppState;

pub const DEV_KEY: &str = "dev-owner-key";
pub const PARTNER_KEY: &str = "partner-owner-key";

pub fn app() -> Router {
    let state = AppState::in_memory(Config::for_tests()).expect("state");
    agenthubd::router(state)
}

/// Send one request; returns (status, headers, parsed JSON body).
pub async fn send(
    app: &Router,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<serde_json::Value>,
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, headers, json)
}

/// Register an agent as owner-dev and give it an active credential.
/// Returns the credential's plaintext secret.
pub async fn register_agent_with_credential(
    app: &Router,
    agent_id: &str,
    scopes: &[&str],
) -> String {
    let (status, _, _) = send(
        app,
        "POST",
        "/v1/identity/agents",
        &[
            ("x-api-key", DEV_KEY),
            ("idempotency-key", &format!("reg-{agent_id}")),
        ],
        Some(serde_json::json!({
            "agent_id": agent_id,
            "credential_type": "api_key",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "agent registration failed");

    let (status, _, body) = send(
        app,
        "POST",
        &format!("/v1/identity/agents/{agent_id}/credentials"),
        &[("x-api-key", DEV_KEY)],
        Some(serde_json::json!({
            "scopes": scopes,
            "ttl_seconds": 3600,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "credential issuance failed");
    body["secret"].as_str().expect("secret").to_string()
}

/// Register an agent without any credential.
pub async fn register_agent(app: &Router, agent_id: &str) {
    let (status, _, _) = send(
        app,
        "POST",
        "/v1/identity/agents",
        &[
            ("x-api-key", DEV_KEY),
            ("idempotency-key", &format!("reg-{agent_id}")),
        ],
        Some(serde_json::json!({
            "agent_id": agent_id,
            "credential_type": "api_key",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "agent registration failed");
}

pub fn detail_code(body: &serde_json::Value) -> &str {
    body["detail"]["code"].as_str().unwrap_or("")
}
