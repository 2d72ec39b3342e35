//! End-to-end delegation scenarios: idempotent writes, budget hard stop,
//! breaker gating.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use axum::http::StatusCode;
use common::{detail_code, register_agent, register_agent_with_credential, send, DEV_KEY};

fn delegation_body(units: f64) -> serde_json::Value {
    serde_json::json!({
        "requester_agent_id": "agt-req",
        "delegate_agent_id": "agt-del",
        "task_spec": "summarize the corpus",
        "estimated_cost_usd": units,
        "max_budget_usd": 20.0,
    })
}

#[tokio::test]
async fn idempotent_delegation_replay_and_conflict() {
    let app = common::app();
    register_agent(&app, "agt-req").await;
    register_agent(&app, "agt-del").await;

    let (status, headers, first) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "k1")],
        Some(delegation_body(10.0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-agenthub-idempotent-replay").is_none());
    assert_eq!(first["status"], "settled");
    let d1 = first["delegation_id"].as_str().unwrap().to_string();

    // Same key, same body: byte-identical replay with the replay header.
    let (status, headers, replay) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "k1")],
        Some(delegation_body(10.0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get("x-agenthub-idempotent-replay")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
    assert_eq!(replay["delegation_id"].as_str().unwrap(), d1);
    assert_eq!(replay, first);

    // Same key, different payload: conflict.
    let (status, _, body) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "k1")],
        Some(delegation_body(11.0)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(
        detail_code(&body),
        "idempotency.key_reused_with_different_payload"
    );
}

#[tokio::test]
async fn missing_idempotency_key_is_rejected() {
    let app = common::app();
    register_agent(&app, "agt-req").await;
    register_agent(&app, "agt-del").await;

    let (status, _, body) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY)],
        Some(delegation_body(10.0)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(detail_code(&body), "schema.idempotency_key_required");
}

#[tokio::test]
async fn delegation_status_and_contract_endpoints() {
    let app = common::app();
    register_agent(&app, "agt-req").await;
    register_agent(&app, "agt-del").await;

    let (_, _, created) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "k-status")],
        Some(delegation_body(10.0)),
    )
    .await;
    let delegation_id = created["delegation_id"].as_str().unwrap();

    let (status, _, fetched) = send(
        &app,
        "GET",
        &format!("/v1/delegations/{delegation_id}/status"),
        &[("x-api-key", DEV_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "settled");
    assert_eq!(fetched["stage"], "feedback");
    assert_eq!(fetched["contract"]["version"], "delegation-contract-v2");
    assert_eq!(
        fetched["lifecycle"].as_array().unwrap().len(),
        6,
        "all six stages recorded"
    );

    let (status, _, contract) = send(
        &app,
        "GET",
        "/v1/delegations/contract",
        &[("x-api-key", DEV_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(contract["version"], "delegation-contract-v2");
    assert_eq!(
        contract["retry_matrix"]["transient_network_error"]["max_retries"],
        2
    );
    assert_eq!(contract["budget_thresholds"]["soft_alert_pct"], 80);
    assert_eq!(contract["budget_thresholds"]["reauthorization_pct"], 100);
    assert_eq!(contract["budget_thresholds"]["hard_stop_pct"], 120);
}

#[tokio::test]
async fn budget_hard_stop_rejects_next_cost_bearing_call() {
    let app = common::app();
    register_agent_with_credential(&app, "agt-spender", &["read"]).await;
    register_agent(&app, "agt-sub").await;

    // Token with a 10 USD budget attached at issuance.
    let (status, _, token) = send(
        &app,
        "POST",
        "/v1/identity/delegation-tokens",
        &[("x-api-key", DEV_KEY)],
        Some(serde_json::json!({
            "issuer_agent_id": "agt-spender",
            "subject_agent_id": "agt-sub",
            "delegated_scopes": ["read"],
            "ttl_seconds": 3600,
            "max_budget_usd": 10.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token_id = token["token_id"].as_str().unwrap().to_string();

    // Events totalling 12.50 (the second one crosses into hard stop).
    let (status, _, first) = send(
        &app,
        "POST",
        "/v1/delegations/budget-events",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "be-1")],
        Some(serde_json::json!({
            "token_id": token_id, "cost_usd": 9.0, "description": "llm calls",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["state"], "soft_alert");
    assert_eq!(first["warnings"], serde_json::json!(["budget.soft_alert"]));

    let (status, _, second) = send(
        &app,
        "POST",
        "/v1/delegations/budget-events",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "be-2")],
        Some(serde_json::json!({
            "token_id": token_id, "cost_usd": 3.5, "description": "tool calls",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["state"], "hard_stop");
    assert_eq!(second["spend_ratio"], 1.25);

    // The next cost-bearing call is refused.
    let (status, _, body) = send(
        &app,
        "POST",
        "/v1/delegations/budget-events",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "be-3")],
        Some(serde_json::json!({
            "token_id": token_id, "cost_usd": 0.01, "description": "denied",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(detail_code(&body), "budget.hard_stop");
    assert_eq!(body["detail"]["fields"]["spend_ratio"], 1.25);

    let (status, _, evaluated) = send(
        &app,
        "GET",
        &format!("/v1/delegations/budget/{token_id}"),
        &[("x-api-key", DEV_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(evaluated["state"], "hard_stop");
    assert_eq!(evaluated["spend_ratio"], 1.25);
}

#[tokio::test]
async fn breaker_opens_on_error_rate_and_rejects_new_delegations() {
    let app = common::app();
    register_agent(&app, "agt-req").await;
    register_agent(&app, "agt-del").await;

    // Eight clean delegations, then four injected failures: the window
    // only crosses the 30% error threshold after the twelfth lands.
    for i in 0..8 {
        let (status, _, _) = send(
            &app,
            "POST",
            "/v1/delegations",
            &[("x-api-key", DEV_KEY), ("idempotency-key", &format!("ok-{i}"))],
            Some(delegation_body(10.0)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    for i in 0..4 {
        let mut body = delegation_body(10.0);
        body["simulated_failure_class"] = serde_json::json!("delegate_timeout");
        let (status, _, _) = send(
            &app,
            "POST",
            "/v1/delegations",
            &[("x-api-key", DEV_KEY), ("idempotency-key", &format!("fail-{i}"))],
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    let (status, _, dashboard) = send(
        &app,
        "GET",
        "/v1/reliability/slo-dashboard?window_size=50",
        &[("x-api-key", DEV_KEY)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dashboard["window"]["evaluated_delegations"], 12);
    assert_eq!(dashboard["circuit_breaker"]["state"], "open");
    assert_eq!(
        dashboard["circuit_breaker"]["governance_action"],
        "reject_new_delegations"
    );

    let (status, _, body) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "gated")],
        Some(delegation_body(10.0)),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(detail_code(&body), "breaker.open");

    // Operator reset restores service.
    let (status, _, _) = send(
        &app,
        "POST",
        "/v1/reliability/breaker/reset",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "reset-1")],
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "after-reset")],
        Some(delegation_body(10.0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn estimated_above_max_budget_is_rejected() {
    let app = common::app();
    register_agent(&app, "agt-req").await;
    register_agent(&app, "agt-del").await;

    let mut body = delegation_body(30.0); // max stays 20.0
    body["max_budget_usd"] = serde_json::json!(20.0);
    let (status, _, _) = send(
        &app,
        "POST",
        "/v1/delegations",
        &[("x-api-key", DEV_KEY), ("idempotency-key", "ceiling")],
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
