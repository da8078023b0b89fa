//! Session model
//!
//! A session is one cached result set. Its status follows a strict state
//! machine:
//!
//! ```text
//! Pending -> Active -> Completed
//!    |         |----> Failed
//!    |         |----> Cancelled
//!    |         '----> TimedOut
//!    '--> Failed | Cancelled | TimedOut
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Prefix of every session id (and therefore every cache table)
pub const SESSION_PREFIX: &str = "cache_";

/// Longest user segment kept in a session id
const MAX_USER_SEGMENT: usize = 64;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Admitted, row count not yet known
    Pending,
    /// Streaming rows into the cache
    Active,
    /// All rows cached
    Completed,
    /// Execution failed
    Failed,
    /// Cancelled by the caller or released by the display gate
    Cancelled,
    /// No progress within the active timeout
    TimedOut,
}

impl SessionStatus {
    /// Check if the session reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Pending or Active; counts against the concurrency cap
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Active) => true,
            (Active, Completed) => true,
            (Pending | Active, Failed | Cancelled | TimedOut) => true,
            _ => false,
        }
    }

    /// Stored representation
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(EngineError::Internal(format!("unknown session status '{}'", other))),
        }
    }
}

/// One cached result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id, also the cache table name
    pub session_id: String,
    /// Owning user
    pub user_id: String,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// Last lookup or transition
    pub last_accessed: DateTime<Utc>,
    /// Last streaming progress (or admission)
    pub last_progress_at: DateTime<Utc>,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Rows expected, known after the count
    pub total_rows: u64,
    /// Rows cached so far; never decreases
    pub processed_rows: u64,
    /// Wall-clock execution time, set on completion
    pub execution_time_s: f64,
    /// Failure reason
    pub error_message: Option<String>,
    /// Caller's browser session, if any
    pub browser_session_id: Option<String>,
    /// Original column names from the upstream cursor
    pub columns: Vec<String>,
}

impl Session {
    /// Create a Pending session
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        browser_session_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            created_at: now,
            last_accessed: now,
            last_progress_at: now,
            status: SessionStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            execution_time_s: 0.0,
            error_message: None,
            browser_session_id,
            columns: Vec::new(),
        }
    }

    /// Whether cached rows may be read: Completed, or Active with at least one row
    pub fn is_readable(&self) -> bool {
        match self.status {
            SessionStatus::Completed => true,
            SessionStatus::Active => self.processed_rows >= 1,
            _ => false,
        }
    }

    /// Completion percentage in `[0, 100]`
    pub fn progress_pct(&self) -> f64 {
        if self.status == SessionStatus::Completed {
            return 100.0;
        }
        if self.total_rows == 0 {
            return 0.0;
        }
        (self.processed_rows as f64 / self.total_rows as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Build the session id for `user_id` at `now` with sequence `seq`.
///
/// Pattern: `cache_<user>_<YYYYMMDDHHMMSS>_<nnn>`. The user segment is
/// lowercased and reduced to `[a-z0-9_]` so the id is a valid table name.
pub fn session_id_for(user_id: &str, now: DateTime<Utc>, seq: u32) -> String {
    format!(
        "{}{}_{}_{:03}",
        SESSION_PREFIX,
        sanitize_user(user_id),
        now.format("%Y%m%d%H%M%S"),
        seq % 1000
    )
}

fn sanitize_user(user_id: &str) -> String {
    let cleaned: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_USER_SEGMENT)
        .collect();
    if cleaned.is_empty() {
        "anon".to_string()
    } else {
        cleaned
    }
}
