//! HTTP error mapping. This is the single boundary where internal error
//! sums become status codes and the `{"detail": {...}}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
        fields: Option<Value>,
    },
    #[error("{message}")]
    Unauthorized { code: String, message: String },
    #[error("{message}")]
    PaymentRequired {
        code: &'static str,
        message: String,
        fields: Option<Value>,
    },
    #[error("{message}")]
    Forbidden {
        code: String,
        message: String,
        fields: Option<Value>,
    },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Conflict { code: &'static str, message: String },
    #[error("delegation circuit breaker is open")]
    BreakerOpen { breaker: Value, alerts: Value },
    #[error("request timed out")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            code: "schema.invalid",
            message: message.into(),
            fields: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound {
            message: message.into(),
        }
    }

    pub fn unauthorized(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            code: code.into(),
            message: message.into(),
            fields: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, fields) = match self {
            ApiError::Validation {
                code,
                message,
                fields,
            } => (StatusCode::BAD_REQUEST, code.to_string(), message, fields),
            ApiError::Unauthorized { code, message } => {
                (StatusCode::UNAUTHORIZED, code, message, None)
            }
            ApiError::PaymentRequired {
                code,
                message,
                fields,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                code.to_string(),
                message,
                fields,
            ),
            ApiError::Forbidden {
                code,
                message,
                fields,
            } => (StatusCode::FORBIDDEN, code, message, fields),
            ApiError::NotFound { message } => (
                StatusCode::NOT_FOUND,
                "not_found".to_string(),
                message,
                None,
            ),
            ApiError::Conflict { code, message } => {
                (StatusCode::CONFLICT, code.to_string(), message, None)
            }
            ApiError::BreakerOpen { breaker, alerts } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "breaker.open".to_string(),
                "delegation circuit breaker is open".to_string(),
                Some(serde_json::json!({
                    "circuit_breaker": breaker,
                    "alerts": alerts,
                })),
            ),
            ApiError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout.request".to_string(),
                "request timed out".to_string(),
                None,
            ),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal".to_string(),
                    "internal error".to_string(),
                    None,
                )
            }
        };

        let mut detail = serde_json::json!({
            "code": code,
            "message": message,
        });
        if let (Some(obj), Some(fields)) = (detail.as_object_mut(), fields) {
            obj.insert("fields".to_string(), fields);
        }
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<agenthub_identity::Error> for ApiError {
    fn from(err: agenthub_identity::Error) -> Self {
        use agenthub_identity::Error as E;
        match err {
            E::NotFound(message) => ApiError::NotFound { message },
            E::AlreadyExists(message) => ApiError::Conflict {
                code: "identity.already_exists",
                message,
            },
            E::OwnerMismatch => ApiError::Forbidden {
                code: "identity.owner_mismatch".to_string(),
                message: "owner mismatch".to_string(),
                fields: None,
            },
            E::IdentityInactive { agent_id, status } => ApiError::Forbidden {
                code: format!("identity.{status}"),
                message: format!("agent identity {agent_id} is {status}"),
                fields: None,
            },
            E::CredentialInvalid => {
                ApiError::unauthorized("auth.invalid_credential", "invalid credential")
            }
            E::CredentialExpired => {
                ApiError::unauthorized("identity.expired", "credential expired")
            }
            E::CredentialInactive(status) => {
                let code = if status == "revoked" {
                    "identity.revoked"
                } else {
                    "auth.invalid_credential"
                };
                ApiError::unauthorized(code, format!("credential is {status}"))
            }
            E::Revoked => ApiError::unauthorized("identity.revoked", "revoked"),
            E::Expired => ApiError::unauthorized("identity.expired", "expired"),
            E::InvalidSignature => {
                ApiError::unauthorized("auth.invalid_signature", "invalid signature")
            }
            E::ScopeNotAttenuated { excess } => ApiError::Validation {
                code: "identity.scope_not_attenuated",
                message: "requested scopes exceed parent grant".to_string(),
                fields: Some(serde_json::json!({ "excess_scopes": excess })),
            },
            E::ChainTooDeep { depth, max } => ApiError::Validation {
                code: "identity.chain_too_deep",
                message: format!("delegation chain depth limit exceeded: {depth} > {max}"),
                fields: None,
            },
            E::ChainInvalid { hop, reason } => ApiError::Unauthorized {
                code: "delegation.chain_invalid".to_string(),
                message: format!("delegation chain invalid at hop {hop}: {reason}"),
            },
            E::NoActiveCredentials => ApiError::Validation {
                code: "identity.no_active_credentials",
                message: "issuer has no active credentials".to_string(),
                fields: None,
            },
            E::Invalid(message) => ApiError::validation(message),
            E::Database(e) => ApiError::Internal(format!("database error: {e}")),
            E::Json(e) => ApiError::Internal(format!("json error: {e}")),
            E::Core(e) => ApiError::Internal(format!("crypto error: {e}")),
        }
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Internal(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal(format!("json error: {err}"))
    }
}
