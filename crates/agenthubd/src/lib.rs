#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! AgentHub control-plane daemon.
//!
//! Wires the identity/delegation/policy engines behind an axum surface:
//! authentication resolution, durable idempotent writes, the delegation
//! lifecycle state machine, budget governance, the reliability breaker,
//! and the transactional outbox.

pub mod api;
pub mod auth;
pub mod budget;
pub mod config;
pub mod db;
pub mod error;
pub mod idempotency;
pub mod lifecycle;
pub mod outbox;
pub mod reliability;
pub mod state;

pub use api::router;
pub use config::{AccessMode, Config};
pub use state::AppState;
