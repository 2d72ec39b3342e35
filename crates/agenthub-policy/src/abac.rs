//! ABAC violation checks, applied in a fixed order:
//! tenant boundary, action allowance, MFA requirement.

use serde::{Deserialize, Serialize};

use crate::decision::{Reason, ReasonType};

/// Wildcard action: principal may perform anything.
const WILDCARD_ACTION: &str = "*";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrincipalAttributes {
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub mfa_present: bool,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceAttributes {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub requires_mfa: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AbacContext {
    #[serde(default)]
    pub principal: PrincipalAttributes,
    #[serde(default)]
    pub resource: ResourceAttributes,
    #[serde(default)]
    pub environment: Environment,
}

/// Evaluate the ABAC checks for an action under a context.
pub fn abac_violations(action: &str, ctx: &AbacContext) -> Vec<Reason> {
    let mut reasons = Vec::new();

    if let (Some(principal_tenant), Some(resource_tenant)) =
        (&ctx.principal.tenant_id, &ctx.resource.tenant_id)
    {
        if principal_tenant != resource_tenant {
            reasons.push(Reason {
                code: "abac.tenant_mismatch".to_string(),
                message: "principal and resource tenant boundaries do not match".to_string(),
                reason_type: ReasonType::Violation,
                field: Some("abac_context.tenant_id".to_string()),
                expected: Some(serde_json::json!(resource_tenant)),
                observed: Some(serde_json::json!(principal_tenant)),
            });
        }
    }

    if !ctx.principal.allowed_actions.is_empty() {
        let allowed = ctx
            .principal
            .allowed_actions
            .iter()
            .any(|a| a == action || a == WILDCARD_ACTION);
        if !allowed {
            let mut sorted = ctx.principal.allowed_actions.clone();
            sorted.sort();
            reasons.push(Reason {
                code: "abac.action_not_allowed".to_string(),
                message: "principal is not authorized for requested action".to_string(),
                reason_type: ReasonType::Violation,
                field: Some("abac_context.principal.allowed_actions".to_string()),
                expected: Some(serde_json::json!(sorted)),
                observed: Some(serde_json::json!(action)),
            });
        }
    }

    if ctx.environment.requires_mfa && !ctx.principal.mfa_present {
        reasons.push(Reason {
            code: "abac.mfa_required".to_string(),
            message: "principal must satisfy MFA requirement for this action".to_string(),
            reason_type: ReasonType::Violation,
            field: Some("abac_context.environment.requires_mfa".to_string()),
            expected: Some(serde_json::json!(true)),
            observed: Some(serde_json::json!(ctx.principal.mfa_present)),
        });
    }

    reasons
}
