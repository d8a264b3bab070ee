//! Error types for rule lookup and request dispatch.
//!
//! Nothing here is fatal to the listener: every [`DispatchError`] is turned
//! into a plain-text response at the request boundary.

use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Failure to obtain a usable rule set for a port.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no rule set stored for port {port}")]
    NotFound { port: u16 },

    #[error("rule store unavailable: {0}")]
    Unavailable(String),

    #[error("rule store did not answer within {0:?}")]
    Timeout(Duration),

    #[error("rule set for port {port} is malformed: {source}")]
    Malformed {
        port: u16,
        #[source]
        source: serde_json::Error,
    },
}

impl From<redis::RedisError> for LookupError {
    fn from(e: redis::RedisError) -> Self {
        LookupError::Unavailable(e.to_string())
    }
}

/// Failure while answering a single request.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load mock rules: {0}")]
    ConfigLookup(#[from] LookupError),

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("no mock rule matched {method} /{path}")]
    NoMatch { method: String, path: String },

    #[error("failed to encode mock response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DispatchError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::ConfigLookup(_) => StatusCode::BAD_GATEWAY,
            DispatchError::BodyRead(_) => StatusCode::BAD_REQUEST,
            DispatchError::NoMatch { .. } => StatusCode::NOT_FOUND,
            DispatchError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
