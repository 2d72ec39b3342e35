#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! ABAC policy evaluation with signed decisions.
//!
//! The evaluator takes a principal / resource / environment context and an
//! action, applies the checks in a fixed order, and returns a
//! [`PolicyDecision`] whose explainability block is sufficient to
//! reconstruct the outcome without replaying state. Decisions are sealed
//! with HMAC-SHA256 over their canonical JSON payload; for identical inputs
//! the decision and its signature are identical.

mod abac;
mod decision;

pub use abac::{abac_violations, AbacContext, Environment, PrincipalAttributes, ResourceAttributes};
pub use decision::{
    build_decision, verify_decision_signature, DecisionOutcome, PolicyDecision, PolicySigner,
    Reason, ReasonType, POLICY_VERSION,
};
