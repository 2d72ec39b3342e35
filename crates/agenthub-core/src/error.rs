//! Error types for agenthub-core operations

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Non-finite numbers are not valid JSON")]
    NonFiniteNumber,

    #[error("JSON serialization error: {0}")]
    JsonError(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e.to_string())
    }
}

/// Result type for agenthub-core operations
pub type Result<T> = std::result::Result<T, Error>;
