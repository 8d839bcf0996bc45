//! Error types and HTTP response conversion.
//!
//! This module defines the gateway's error taxonomy and implements conversion
//! to HTTP responses with appropriate status codes and JSON payloads.
//!
//! # Status mapping
//!
//! - `InvalidSql` / `NoRecognizedTables` / `UnknownTable` / `JoinEngine` → 400
//! - `AuthInvalid` → 401
//! - `RateLimitExhausted` → 429 with a `Retry-After: 5` header
//! - `SourceTimeout` → 504
//! - everything else (including `DagCycle`, which is unreachable while all
//!   fetch nodes are independent) → 500
//!
//! Handlers return `Result<T, Error>` and errors convert automatically:
//!
//! ```json
//! {
//!   "error": "RATE_LIMIT_EXHAUSTED",
//!   "message": "Rate limit exhausted for connector 'github' (0 tokens left)",
//!   "details": "...",
//!   "retry_after_seconds": 5
//! }
//! ```

use axum::{
    http::{StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

/// Retry-After header value (in seconds) for 429 responses. Callers that
/// cannot wait are invited to raise `max_staleness_ms` instead.
const RATE_LIMITED_RETRY_AFTER_SECS: &str = "5";

#[derive(ThisError, Debug)]
pub enum Error {
    /// The submitted SQL could not be parsed
    #[error("SQL parse error: {message}")]
    InvalidSql { message: String },

    /// The query references no table known to the tenant
    #[error("No recognized tables in query. Available: {available}")]
    NoRecognizedTables { available: String },

    /// A table passed validation but is missing from the tenant registry
    #[error("Unknown table: '{table}'. Available: {available}")]
    UnknownTable { table: String, available: String },

    /// Bearer token missing, malformed, or rejected
    #[error("{message}")]
    AuthInvalid { message: String },

    /// Token bucket empty and no stale data to fall back on
    #[error("Rate limit exhausted for connector '{connector_id}' ({remaining} tokens remaining)")]
    RateLimitExhausted { connector_id: String, remaining: i64 },

    /// All retry attempts against an upstream source failed
    #[error("Source '{connector_id}' did not respond after {attempts} attempts")]
    SourceTimeout { connector_id: String, attempts: u32 },

    /// Upstream returned a non-retryable HTTP status
    #[error("Source '{connector_id}' returned HTTP {status}: {message}")]
    SourceFatal {
        connector_id: String,
        status: u16,
        message: String,
    },

    /// The execution graph contains a cycle
    #[error("Execution graph has a cycle among nodes: {nodes}")]
    DagCycle { nodes: String },

    /// The join engine rejected the rewritten SQL at runtime
    #[error("SQL execution error: {message}")]
    JoinEngine { message: String },

    /// A tenant configuration document failed validation
    #[error("Invalid tenant configuration '{path}': {message}")]
    ConfigInvalid { path: String, message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidSql { .. }
            | Error::NoRecognizedTables { .. }
            | Error::UnknownTable { .. }
            | Error::JoinEngine { .. } => StatusCode::BAD_REQUEST,
            Error::AuthInvalid { .. } => StatusCode::UNAUTHORIZED,
            Error::RateLimitExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::SourceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::SourceFatal { .. }
            | Error::DagCycle { .. }
            | Error::ConfigInvalid { .. }
            | Error::Internal { .. }
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire-visible error kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidSql { .. } => "INVALID_SQL",
            Error::NoRecognizedTables { .. } => "NO_RECOGNIZED_TABLES",
            Error::UnknownTable { .. } => "UNKNOWN_TABLE",
            Error::AuthInvalid { .. } => "AUTH_INVALID",
            Error::RateLimitExhausted { .. } => "RATE_LIMIT_EXHAUSTED",
            Error::SourceTimeout { .. } => "SOURCE_TIMEOUT",
            Error::SourceFatal { .. } => "SOURCE_FATAL",
            Error::DagCycle { .. } => "DAG_CYCLE",
            Error::JoinEngine { .. } => "JOIN_ENGINE_ERROR",
            Error::ConfigInvalid { .. } => "CONFIG_INVALID",
            Error::Internal { .. } | Error::Other(_) => "INTERNAL",
        }
    }

    /// Returns a user-safe error message, without leaking internal detail.
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details - level tracks severity
        match &self {
            Error::Internal { .. } | Error::Other(_) | Error::DagCycle { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::SourceTimeout { .. } | Error::SourceFatal { .. } => {
                tracing::warn!("Upstream source error: {}", self);
            }
            Error::ConfigInvalid { .. } => {
                tracing::warn!("Configuration error: {}", self);
            }
            Error::RateLimitExhausted { .. } => {
                tracing::info!("Rate limit exceeded: {}", self);
            }
            Error::AuthInvalid { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            _ => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            Error::RateLimitExhausted { .. } => {
                let body = json!({
                    "error": self.kind(),
                    "message": self.user_message(),
                    "details": "Downstream connector budget exhausted. Retry after the \
                                indicated interval or use a higher max_staleness_ms to \
                                serve from cache.",
                    "retry_after_seconds": 5,
                });
                (
                    status,
                    [(RETRY_AFTER, RATE_LIMITED_RETRY_AFTER_SECS)],
                    axum::response::Json(body),
                )
                    .into_response()
            }
            Error::SourceTimeout { .. } => {
                let body = json!({
                    "error": self.kind(),
                    "message": self.user_message(),
                    "details": "Upstream SaaS connector did not respond within deadline.",
                });
                (status, axum::response::Json(body)).into_response()
            }
            _ => {
                let body = json!({
                    "error": self.kind(),
                    "message": self.user_message(),
                });
                (status, axum::response::Json(body)).into_response()
            }
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_wire_contract() {
        let cases: Vec<(Error, StatusCode)> = vec![
            (
                Error::InvalidSql {
                    message: "x".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::NoRecognizedTables {
                    available: "github.pull_requests".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::AuthInvalid {
                    message: "Invalid token".into(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (
                Error::RateLimitExhausted {
                    connector_id: "github".into(),
                    remaining: 0,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Error::SourceTimeout {
                    connector_id: "jira".into(),
                    attempts: 3,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                Error::JoinEngine {
                    message: "binder error".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::Internal {
                    operation: "connect".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "kind {}", err.kind());
        }
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = Error::Internal {
            operation: "talk to redis at 10.0.0.3".into(),
        };
        assert_eq!(err.user_message(), "Internal server error");
    }
}
