//! Error types for snowcache-upstream
//!
//! Every driver failure is folded into one of four caller-visible kinds:
//! - Unavailable: the warehouse could not be reached or the pool is saturated
//! - Syntax: the warehouse rejected the statement text
//! - Timeout: a round trip exceeded the RPC deadline
//! - Generic: anything else the driver reported
//!
//! Value conversion and configuration problems get their own categories so the
//! engine can tell them apart from warehouse faults.

use std::fmt;
use thiserror::Error;

/// Result type for snowcache-upstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a driver message surfaced to callers
pub const MAX_MESSAGE_LEN: usize = 500;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection failures and pool exhaustion (retriable)
    Unavailable,
    /// Statement rejected by the parser
    Syntax,
    /// Round trip exceeded its deadline (retriable)
    Timeout,
    /// Any other driver error
    Generic,
    /// A value could not be converted
    TypeConversion,
    /// Invalid configuration
    Configuration,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Unavailable | Self::Timeout)
    }
}

/// Main error type for snowcache-upstream
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Could not connect to the warehouse
    #[error("upstream unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The warehouse rejected the statement
    #[error("upstream syntax error: {message}")]
    Syntax { message: String, sql: Option<String> },

    /// Round trip exceeded the configured deadline
    #[error("upstream timeout: {message}")]
    Timeout { message: String },

    /// Driver-reported failure with no better classification
    #[error("upstream error: {message}")]
    Generic {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection pool has no lease to hand out
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable { .. } | Self::PoolExhausted { .. } => ErrorCategory::Unavailable,
            Self::Syntax { .. } => ErrorCategory::Syntax,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Generic { .. } => ErrorCategory::Generic,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Configuration { .. } => ErrorCategory::Configuration,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Driver message truncated to [`MAX_MESSAGE_LEN`] characters
    pub fn truncated_message(&self) -> String {
        truncate_message(&self.to_string(), MAX_MESSAGE_LEN)
    }

    /// Create an unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create an unavailable error with source
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a syntax error
    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a syntax error carrying the offending SQL
    pub fn syntax_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a generic driver error
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
            source: None,
        }
    }

    /// Create a generic driver error with source
    pub fn generic_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Generic {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::Syntax => write!(f, "syntax"),
            Self::Timeout => write!(f, "timeout"),
            Self::Generic => write!(f, "generic"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Truncate `message` to at most `max` characters, never splitting a code point.
pub fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
