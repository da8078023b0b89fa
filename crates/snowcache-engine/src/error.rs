//! Error types for snowcache-engine
//!
//! [`EngineError`] carries one variant per caller-visible failure. Each maps to
//! a stable [`ErrorCode`] string via [`EngineError::code`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use snowcache_upstream::error::{truncate_message, MAX_MESSAGE_LEN};

use crate::session::SessionStatus;

/// Result type for snowcache-engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ErrorCode {
    ValidationError,
    InvalidSession,
    NoData,
    LimitExceeded,
    NotReady,
    UpstreamError,
    Timeout,
    Cancelled,
    UnsupportedType,
    InternalError,
}

impl ErrorCode {
    /// Wire representation
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidSession => "INVALID_SESSION",
            Self::NoData => "NO_DATA",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::NotReady => "NOT_READY",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::UnsupportedType => "UNSUPPORTED_TYPE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for snowcache-engine
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum EngineError {
    /// Statement rejected by the validator
    #[error("validation failed: {0}")]
    Validation(String),

    /// Concurrency cap reached
    #[error("busy: {limit} queries already running")]
    Busy { limit: usize },

    /// Result set exceeds the hard size gate
    #[error("too_large: {total} rows exceeds the limit of {cap}")]
    TooLarge { total: u64, cap: u64 },

    /// No such session
    #[error("session not found: {0}")]
    NotFound(String),

    /// Session has no readable rows yet
    #[error("session {0} is not ready")]
    NotReady(String),

    /// Session ended without readable data
    #[error("session {session_id} has no data ({status})")]
    NoData {
        session_id: String,
        status: SessionStatus,
    },

    /// Export row cap exceeded
    #[error("{what} limit exceeded: {actual} rows, cap is {cap}")]
    LimitExceeded {
        what: &'static str,
        cap: u64,
        actual: u64,
    },

    /// Upstream failure
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Upstream round trip timed out
    #[error("upstream timeout: {0}")]
    Timeout(String),

    /// Session was cancelled
    #[error("session {0} was cancelled")]
    Cancelled(String),

    /// Value outside the string cell policy
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Column name not in the session header
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    /// Session is already terminal
    #[error("session {session_id} cannot be cancelled ({status})")]
    NotCancellable {
        session_id: String,
        status: SessionStatus,
    },

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Embedded store failure
    #[error("cache store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// I/O failure while encoding an export
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_)
            | Self::UnknownColumn(_)
            | Self::NotCancellable { .. }
            | Self::Config(_) => ErrorCode::ValidationError,
            Self::Busy { .. } | Self::TooLarge { .. } | Self::LimitExceeded { .. } => {
                ErrorCode::LimitExceeded
            }
            Self::NotFound(_) => ErrorCode::InvalidSession,
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::NoData { .. } => ErrorCode::NoData,
            Self::Upstream(_) => ErrorCode::UpstreamError,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::UnsupportedType(_) => ErrorCode::UnsupportedType,
            Self::Store(_) | Self::Io(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message suitable for `error_message`, truncated to 500 characters
    pub fn message(&self) -> String {
        truncate_message(&self.to_string(), MAX_MESSAGE_LEN)
    }

    /// Whether a store error is transient (busy or locked) and worth one retry
    pub fn is_transient_store_error(err: &rusqlite::Error) -> bool {
        matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

impl From<snowcache_upstream::Error> for EngineError {
    fn from(err: snowcache_upstream::Error) -> Self {
        use snowcache_upstream::Error as Up;
        match &err {
            Up::Timeout { .. } => Self::Timeout(err.truncated_message()),
            Up::TypeConversion { message } => Self::UnsupportedType(truncate_message(message, MAX_MESSAGE_LEN)),
            Up::Configuration { message } => Self::Config(message.clone()),
            _ => Self::Upstream(err.truncated_message()),
        }
    }
}

impl From<zip::result::ZipError> for EngineError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Internal(format!("xlsx container: {}", err))
    }
}

/// Error payload as returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code(),
            message: err.message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(EngineError::Validation("x".into()).code(), ErrorCode::ValidationError);
        assert_eq!(EngineError::Busy { limit: 5 }.code(), ErrorCode::LimitExceeded);
        assert_eq!(
            EngineError::TooLarge { total: 2, cap: 1 }.code(),
            ErrorCode::LimitExceeded
        );
        assert_eq!(EngineError::NotFound("s".into()).code(), ErrorCode::InvalidSession);
        assert_eq!(EngineError::NotReady("s".into()).code(), ErrorCode::NotReady);
        assert_eq!(EngineError::Cancelled("s".into()).code(), ErrorCode::Cancelled);
        assert_eq!(EngineError::UnknownColumn("c".into()).code(), ErrorCode::ValidationError);
        assert_eq!(EngineError::Internal("boom".into()).code(), ErrorCode::InternalError);
    }

    #[test]
    fn test_code_strings() {
        assert_eq!(ErrorCode::InvalidSession.to_string(), "INVALID_SESSION");
        assert_eq!(
            serde_json::to_string(&ErrorCode::UnsupportedType).unwrap(),
            "\"UNSUPPORTED_TYPE\""
        );
    }

    #[test]
    fn test_upstream_mapping() {
        let err: EngineError = snowcache_upstream::Error::timeout("fetch exceeded 30000ms").into();
        assert_eq!(err.code(), ErrorCode::Timeout);

        let err: EngineError =
            snowcache_upstream::Error::type_conversion("VARIANT values cannot be cached").into();
        assert_eq!(err.code(), ErrorCode::UnsupportedType);

        let err: EngineError = snowcache_upstream::Error::syntax("near FORM").into();
        assert_eq!(err.code(), ErrorCode::UpstreamError);
    }

    #[test]
    fn test_message_truncated() {
        let err: EngineError = snowcache_upstream::Error::generic("y".repeat(5_000)).into();
        assert!(err.message().chars().count() <= MAX_MESSAGE_LEN);
    }

    #[test]
    fn test_limit_exceeded_reports_both_counts() {
        let err = EngineError::LimitExceeded {
            what: "clipboard",
            cap: 50_000,
            actual: 60_000,
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, ErrorCode::LimitExceeded);
        assert!(body.message.contains("50000"));
        assert!(body.message.contains("60000"));
    }
}
