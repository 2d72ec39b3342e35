//! ABAC evaluation scenario: MFA-gated publish denied with a signed,
//! verifiable, deterministic decision.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use agenthub_policy::{
    abac_violations, build_decision, verify_decision_signature, AbacContext, DecisionOutcome,
    Environment, PolicySigner, PrincipalAttributes, ResourceAttributes,
};

fn evaluate(signer: &PolicySigner) -> agenthub_policy::PolicyDecision {
    let ctx = AbacContext {
        principal: PrincipalAttributes {
            tenant_id: Some("t1".to_string()),
            allowed_actions: vec!["agents.publish".to_string()],
            mfa_present: false,
            owner: Some("owner-dev".to_string()),
        },
        resource: ResourceAttributes {
            tenant_id: Some("t1".to_string()),
        },
        environment: Environment { requires_mfa: true },
    };
    let reasons = abac_violations("agents.publish", &ctx);
    build_decision(
        signer,
        "runtime.policy",
        "agents.publish",
        "owner-dev",
        serde_json::json!({ "tenant_id": "t1" }),
        serde_json::json!({
            "abac_context.tenant_id": "t1",
            "abac_context.environment.requires_mfa": true,
        }),
        reasons,
    )
}

#[test]
fn mfa_required_denies_with_violation_code() {
    let signer = PolicySigner::new(b"test-policy-secret");
    let decision = evaluate(&signer);

    assert_eq!(decision.decision, DecisionOutcome::Deny);
    assert_eq!(
        decision.explainability.violation_codes,
        vec!["abac.mfa_required".to_string()]
    );
    assert_eq!(decision.violated_constraints, vec!["abac.mfa_required".to_string()]);
    assert!(verify_decision_signature(&signer, &decision));
}

#[test]
fn decisions_are_deterministic() {
    let signer = PolicySigner::new(b"test-policy-secret");
    let a = evaluate(&signer);
    let b = evaluate(&signer);

    assert_eq!(a.decision_id, b.decision_id);
    assert_eq!(a.input_hash, b.input_hash);
    assert_eq!(a.decision_signature, b.decision_signature);
}

#[test]
fn tampering_breaks_the_signature() {
    let signer = PolicySigner::new(b"test-policy-secret");
    let mut decision = evaluate(&signer);
    decision.actor = "someone-else".to_string();
    assert!(!verify_decision_signature(&signer, &decision));
}

#[test]
fn wrong_signer_fails_verification() {
    let signer = PolicySigner::new(b"test-policy-secret");
    let decision = evaluate(&signer);
    let other = PolicySigner::new(b"another-secret");
    assert!(!verify_decision_signature(&other, &decision));
}
