//! Error taxonomy for the `weatherflow` core.
//!
//! Every operation of the engine returns [`CoreError`]. The HTTP shell in
//! `routes` turns it into the `{code, message, details}` error envelope
//! using [`CoreError::code`], [`CoreError::status`] and
//! [`CoreError::details`].
//!
//! The type is `Clone` because a single cache computation hands the same
//! failure to every caller waiting on it.

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

// ---

/// Errors produced by ingestion, queries, rule registration and publishing.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    // ---
    /// A station report violates the payload schema.
    #[error("malformed report: {reason}")]
    MalformedReport { reason: String },

    /// The report names a station that is not registered.
    #[error("unknown station '{station}'")]
    UnknownStation { station: String },

    /// Query parameters failed validation.
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// The query deadline elapsed before all buckets were computed.
    #[error("query exceeded its deadline of {deadline_ms} ms")]
    QueryTimeout { deadline_ms: u64 },

    /// The backing store could not be reached or failed the operation.
    #[error("backing store unavailable: {reason}")]
    BackingStoreUnavailable { reason: String },

    /// An alert rule was rejected at registration time.
    #[error("invalid rule definition: {reason}")]
    InvalidRuleDefinition { reason: String },

    /// No rule is registered under the given id.
    #[error("rule '{rule_id}' not found")]
    RuleNotFound { rule_id: String },

    /// Delivery to the pub/sub bus failed after exhausting retries.
    #[error("publish to '{topic}' failed after {attempts} attempts: {reason}")]
    PublishFailure {
        topic: String,
        attempts: u32,
        reason: String,
    },
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Serializable error body handed to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl CoreError {
    // ---
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedReport {
            reason: reason.into(),
        }
    }

    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    pub fn invalid_rule(reason: impl Into<String>) -> Self {
        Self::InvalidRuleDefinition {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl std::fmt::Display) -> Self {
        Self::BackingStoreUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedReport { .. } => "MALFORMED_REPORT",
            Self::UnknownStation { .. } => "UNKNOWN_STATION",
            Self::InvalidQuery { .. } => "INVALID_QUERY",
            Self::QueryTimeout { .. } => "QUERY_TIMEOUT",
            Self::BackingStoreUnavailable { .. } => "BACKING_STORE_UNAVAILABLE",
            Self::InvalidRuleDefinition { .. } => "INVALID_RULE_DEFINITION",
            Self::RuleNotFound { .. } => "RULE_NOT_FOUND",
            Self::PublishFailure { .. } => "PUBLISH_FAILURE",
        }
    }

    /// HTTP status the error maps onto.
    ///
    /// `UnknownStation` is a 422 on the ingest path; the latest-reading
    /// route overrides it to 404.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedReport { .. }
            | Self::InvalidQuery { .. }
            | Self::InvalidRuleDefinition { .. } => StatusCode::BAD_REQUEST,
            Self::UnknownStation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RuleNotFound { .. } => StatusCode::NOT_FOUND,
            Self::QueryTimeout { .. } | Self::BackingStoreUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::PublishFailure { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Structured details for the error envelope.
    pub fn details(&self) -> Value {
        match self {
            Self::MalformedReport { reason }
            | Self::InvalidQuery { reason }
            | Self::InvalidRuleDefinition { reason }
            | Self::BackingStoreUnavailable { reason } => json!({ "reason": reason }),
            Self::UnknownStation { station } => json!({ "station": station }),
            Self::QueryTimeout { deadline_ms } => json!({ "deadline_ms": deadline_ms }),
            Self::RuleNotFound { rule_id } => json!({ "rule_id": rule_id }),
            Self::PublishFailure {
                topic,
                attempts,
                reason,
            } => json!({ "topic": topic, "attempts": attempts, "reason": reason }),
        }
    }

    /// Whether ingestion should log and drop rather than treat the error as fatal.
    pub fn is_recoverable_ingest(&self) -> bool {
        matches!(
            self,
            Self::MalformedReport { .. } | Self::UnknownStation { .. }
        )
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::store(e)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_status_mapping() {
        // ---
        assert_eq!(
            CoreError::invalid_query("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            CoreError::QueryTimeout { deadline_ms: 10 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            CoreError::store("down").status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_body_shape() {
        // ---
        let body = CoreError::UnknownStation {
            station: "KXYZ".to_string(),
        }
        .to_body();

        assert_eq!(body.code, "UNKNOWN_STATION");
        assert_eq!(body.message, "unknown station 'KXYZ'");
        assert_eq!(body.details["station"], "KXYZ");
    }

    #[test]
    fn test_recoverable_ingest() {
        // ---
        assert!(CoreError::malformed("no fields").is_recoverable_ingest());
        assert!(!CoreError::store("down").is_recoverable_ingest());
    }
}
