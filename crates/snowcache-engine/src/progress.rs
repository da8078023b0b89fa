//! Streaming progress and cancellation signals
//!
//! Ephemeral, in-memory only. The registry remains the source of truth; the
//! tracker is what the streaming loop polls between chunks. Each entry owns a
//! [`CancellationToken`] so a waiting fetch can be interrupted as well.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Progress phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Rows are streaming
    Running,
    /// Streaming finished
    Completed,
    /// Streaming failed
    Error,
    /// Cancel requested
    Cancelled,
}

/// Progress of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    /// Session id
    pub session_id: String,
    /// Phase
    pub status: ProgressStatus,
    /// Expected rows
    pub total: u64,
    /// Rows cached so far
    pub processed: u64,
    /// Whether cancellation was requested
    pub cancel_requested: bool,
    /// Failure reason
    pub error: Option<String>,
    /// Last change
    pub last_update: DateTime<Utc>,
}

struct Entry {
    state: ProgressState,
    token: CancellationToken,
}

/// Map of session id to progress
#[derive(Default)]
pub struct ProgressTracker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProgressTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a session; returns its cancellation token.
    ///
    /// Re-creating an existing entry keeps its token, so an earlier cancel
    /// is not lost.
    pub fn create(&self, session_id: &str, total: u64) -> CancellationToken {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| Entry {
                state: ProgressState {
                    session_id: session_id.to_string(),
                    status: ProgressStatus::Running,
                    total,
                    processed: 0,
                    cancel_requested: false,
                    error: None,
                    last_update: Utc::now(),
                },
                token: CancellationToken::new(),
            });
        entry.state.total = total;
        entry.token.clone()
    }

    /// Record rows processed; never decreases
    pub fn update(&self, session_id: &str, processed: u64) {
        self.with_entry(session_id, |e| {
            e.state.processed = e.state.processed.max(processed);
        });
    }

    /// Mark finished with the final row count
    pub fn complete(&self, session_id: &str, processed: u64) {
        self.with_entry(session_id, |e| {
            e.state.processed = e.state.processed.max(processed);
            e.state.status = ProgressStatus::Completed;
        });
    }

    /// Mark failed
    pub fn error(&self, session_id: &str, message: &str) {
        self.with_entry(session_id, |e| {
            e.state.status = ProgressStatus::Error;
            e.state.error = Some(message.to_string());
        });
    }

    /// Request cancellation. Returns `true` if a running entry was signalled.
    pub fn cancel(&self, session_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(session_id) {
            Some(entry) if entry.state.status == ProgressStatus::Running => {
                entry.state.cancel_requested = true;
                entry.state.status = ProgressStatus::Cancelled;
                entry.state.last_update = Utc::now();
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Signal every running entry; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Current progress
    pub fn get(&self, session_id: &str) -> Option<ProgressState> {
        self.entries.lock().get(session_id).map(|e| e.state.clone())
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .get(session_id)
            .map(|e| e.state.cancel_requested)
            .unwrap_or(false)
    }

    /// Stop tracking a session
    pub fn delete(&self, session_id: &str) {
        self.entries.lock().remove(session_id);
    }

    /// Tracked sessions
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn with_entry(&self, session_id: &str, f: impl FnOnce(&mut Entry)) {
        if let Some(entry) = self.entries.lock().get_mut(session_id) {
            f(entry);
            entry.state.last_update = Utc::now();
        }
    }
}
