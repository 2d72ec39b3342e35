//! Signed policy decisions with explainability.

use agenthub_core::{canonical, sha256_hex, HmacSigner};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version stamp carried by every decision.
pub const POLICY_VERSION: &str = "runtime-policy-v3";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonType {
    Violation,
    Warning,
    Allow,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reason {
    pub code: String,
    pub message: String,
    #[serde(rename = "type")]
    pub reason_type: ReasonType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Allow,
    Deny,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Allow => "allow",
            DecisionOutcome::Deny => "deny",
        }
    }
}

/// Explainability block: enough for an operator to reconstruct the decision
/// without replaying state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Explainability {
    pub violation_codes: Vec<String>,
    pub warning_codes: Vec<String>,
    pub allow_codes: Vec<String>,
    pub evaluated_fields: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub policy_version: String,
    pub decision_id: String,
    pub context: String,
    pub action: String,
    pub actor: String,
    pub subject: Value,
    pub decision: DecisionOutcome,
    pub allowed: bool,
    pub reasons: Vec<Reason>,
    pub violated_constraints: Vec<String>,
    pub evaluated_constraints: Value,
    pub input_hash: String,
    pub explainability: Explainability,
    pub decision_signature: String,
}

/// Seals and verifies decisions with the policy signing secret.
#[derive(Clone)]
pub struct PolicySigner {
    signer: HmacSigner,
}

impl PolicySigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            signer: HmacSigner::new(secret),
        }
    }

    fn sign_payload(&self, payload: &Value) -> String {
        match canonical::canonical_bytes(payload) {
            Ok(bytes) => self.signer.sign(&bytes),
            // Decision payloads are built from finite JSON; an encoding
            // failure yields an unverifiable signature rather than a panic.
            Err(_) => String::new(),
        }
    }

    fn verify_payload(&self, payload: &Value, signature: &str) -> bool {
        match canonical::canonical_bytes(payload) {
            Ok(bytes) => self.signer.verify(&bytes, signature),
            Err(_) => false,
        }
    }
}

fn stable_hash(payload: &Value) -> String {
    match canonical::canonical_bytes(payload) {
        Ok(bytes) => sha256_hex(&bytes),
        Err(_) => String::new(),
    }
}

fn signature_payload(decision: &PolicyDecision) -> Value {
    serde_json::json!({
        "policy_version": decision.policy_version,
        "decision_id": decision.decision_id,
        "context": decision.context,
        "action": decision.action,
        "actor": decision.actor,
        "subject": decision.subject,
        "decision": decision.decision.as_str(),
        "violated_constraints": decision.violated_constraints,
        "input_hash": decision.input_hash,
    })
}

/// Build a signed decision from an ordered reason list.
pub fn build_decision(
    signer: &PolicySigner,
    context: &str,
    action: &str,
    actor: &str,
    subject: Value,
    evaluated_constraints: Value,
    mut reasons: Vec<Reason>,
) -> PolicyDecision {
    reasons.sort_by(|a, b| {
        let key = |r: &Reason| {
            (
                match r.reason_type {
                    ReasonType::Allow => 0u8,
                    ReasonType::Violation => 1,
                    ReasonType::Warning => 2,
                },
                r.code.clone(),
                r.field.clone().unwrap_or_default(),
            )
        };
        key(a).cmp(&key(b))
    });

    let mut violated_constraints: Vec<String> = reasons
        .iter()
        .filter(|r| r.reason_type == ReasonType::Violation)
        .map(|r| r.code.clone())
        .collect();
    violated_constraints.sort();
    violated_constraints.dedup();

    let allowed = violated_constraints.is_empty();

    let input_payload = serde_json::json!({
        "context": context,
        "action": action,
        "actor": actor,
        "subject": subject,
        "evaluated_constraints": evaluated_constraints,
        "violated_constraints": violated_constraints,
        "policy_version": POLICY_VERSION,
    });
    let input_hash = stable_hash(&input_payload);
    let decision_id = stable_hash(&serde_json::json!({
        "policy_version": POLICY_VERSION,
        "input_hash": input_hash,
    }))[..24]
        .to_string();

    let mut evaluated_fields: Vec<String> = match &evaluated_constraints {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    };
    evaluated_fields.sort();

    let explainability = Explainability {
        violation_codes: reasons
            .iter()
            .filter(|r| r.reason_type == ReasonType::Violation)
            .map(|r| r.code.clone())
            .collect(),
        warning_codes: reasons
            .iter()
            .filter(|r| r.reason_type == ReasonType::Warning)
            .map(|r| r.code.clone())
            .collect(),
        allow_codes: reasons
            .iter()
            .filter(|r| r.reason_type == ReasonType::Allow)
            .map(|r| r.code.clone())
            .collect(),
        evaluated_fields,
    };

    let mut decision = PolicyDecision {
        policy_version: POLICY_VERSION.to_string(),
        decision_id,
        context: context.to_string(),
        action: action.to_string(),
        actor: actor.to_string(),
        subject,
        decision: if allowed {
            DecisionOutcome::Allow
        } else {
            DecisionOutcome::Deny
        },
        allowed,
        reasons,
        violated_constraints,
        evaluated_constraints,
        input_hash,
        explainability,
        decision_signature: String::new(),
    };
    decision.decision_signature = signer.sign_payload(&signature_payload(&decision));
    decision
}

/// Verify a decision's signature. Deterministic: identical decisions always
/// verify identically.
pub fn verify_decision_signature(signer: &PolicySigner, decision: &PolicyDecision) -> bool {
    signer.verify_payload(&signature_payload(decision), &decision.decision_signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abac::{abac_violations, AbacContext, Environment, PrincipalAttributes, ResourceAttributes};

    fn signer() -> PolicySigner {
        PolicySigner::new(b"test-policy-secret")
    }

    fn evaluate(action: &str, ctx: &AbacContext) -> PolicyDecision {
        let reasons = abac_violations(action, ctx);
        build_decision(
            &signer(),
            "runtime.delegation",
            action,
            "runtime",
            serde_json::json!({"tenant_id": ctx.resource.tenant_id}),
            serde_json::json!({
                "abac_context.tenant_id": ctx.principal.tenant_id,
                "abac_context.environment.requires_mfa": ctx.environment.requires_mfa,
            }),
            reasons,
        )
    }

    fn mfa_case() -> AbacContext {
        AbacContext {
            principal: PrincipalAttributes {
                tenant_id: Some("t1".to_string()),
                allowed_actions: vec!["agents.publish".to_string()],
                mfa_present: false,
                owner: None,
            },
            resource: ResourceAttributes {
                tenant_id: Some("t1".to_string()),
            },
            environment: Environment { requires_mfa: true },
        }
    }

    #[test]
    fn deny_carries_violation_codes() {
        let decision = evaluate("agents.publish", &mfa_case());
        assert_eq!(decision.decision, DecisionOutcome::Deny);
        assert!(!decision.allowed);
        assert_eq!(
            decision.explainability.violation_codes,
            vec!["abac.mfa_required".to_string()]
        );
    }

    #[test]
    fn signature_verifies() {
        let decision = evaluate("agents.publish", &mfa_case());
        assert!(verify_decision_signature(&signer(), &decision));
    }

    #[test]
    fn tampered_decision_fails_verification() {
        let mut decision = evaluate("agents.publish", &mfa_case());
        decision.decision = DecisionOutcome::Allow;
        assert!(!verify_decision_signature(&signer(), &decision));
    }

    #[test]
    fn identical_inputs_identical_signature() {
        let a = evaluate("agents.publish", &mfa_case());
        let b = evaluate("agents.publish", &mfa_case());
        assert_eq!(a.decision_id, b.decision_id);
        assert_eq!(a.input_hash, b.input_hash);
        assert_eq!(a.decision_signature, b.decision_signature);
    }

    #[test]
    fn allow_when_no_violations() {
        let mut ctx = mfa_case();
        ctx.principal.mfa_present = true;
        let decision = evaluate("agents.publish", &ctx);
        assert!(decision.allowed);
        assert!(decision.violated_constraints.is_empty());
        assert!(verify_decision_signature(&signer(), &decision));
    }
}
