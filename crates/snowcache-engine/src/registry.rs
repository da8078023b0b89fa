//! Session registry
//!
//! Authoritative session state. A hot map answers every read; the durable
//! [`SessionLog`] survives restarts. Admission and terminal transitions are
//! written through immediately, progress is batched and flushed at most every
//! `sync_interval`.
//!
//! All operations serialize under one mutex that is never held across an
//! `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use snowcache_upstream::error::{truncate_message, MAX_MESSAGE_LEN};

use crate::error::{EngineError, Result};
use crate::session::{session_id_for, Session, SessionStatus};
use crate::store::SessionLog;

struct Inner {
    sessions: HashMap<String, Session>,
    /// Sessions with progress not yet written to the log
    dirty: HashSet<String>,
    last_flush: Instant,
    seq: u32,
}

/// Statistics for the session registry
#[derive(Debug, Default)]
pub struct RegistryStats {
    admitted: AtomicU64,
    rejected_busy: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
}

impl RegistryStats {
    fn record_terminal(&self, status: SessionStatus) {
        let counter = match status {
            SessionStatus::Completed => &self.completed,
            SessionStatus::Failed => &self.failed,
            SessionStatus::Cancelled => &self.cancelled,
            SessionStatus::TimedOut => &self.timed_out,
            SessionStatus::Pending | SessionStatus::Active => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of registry stats for serialization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RegistryStatsSnapshot {
    pub admitted: u64,
    pub rejected_busy: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
}

impl From<&RegistryStats> for RegistryStatsSnapshot {
    fn from(stats: &RegistryStats) -> Self {
        Self {
            admitted: stats.admitted.load(Ordering::Relaxed),
            rejected_busy: stats.rejected_busy.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            timed_out: stats.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Session registry: hot map plus durable log
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    log: SessionLog,
    max_concurrent: usize,
    sync_interval: Duration,
    stats: RegistryStats,
}

impl SessionRegistry {
    /// Rebuild the registry from the durable log.
    ///
    /// Pending or Active sessions whose last progress is older than
    /// `active_timeout` are moved to TimedOut before anything can see them.
    pub fn recover(
        log: SessionLog,
        max_concurrent: usize,
        sync_interval: Duration,
        active_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let mut sessions = HashMap::new();
        let mut expired = Vec::new();

        for mut session in log.load_all()? {
            if session.status.is_running() && is_stale(&session, active_timeout, now) {
                session.status = SessionStatus::TimedOut;
                session.error_message = Some(format!(
                    "no progress for more than {}s (recovered after restart)",
                    active_timeout.as_secs()
                ));
                session.last_accessed = now;
                warn!(session_id = %session.session_id, "timed out stale session on recovery");
                expired.push(session.clone());
            }
            sessions.insert(session.session_id.clone(), session);
        }
        log.upsert_many(&expired)?;

        info!(
            sessions = sessions.len(),
            timed_out = expired.len(),
            "recovered session registry"
        );

        let registry = Self {
            inner: Mutex::new(Inner {
                sessions,
                dirty: HashSet::new(),
                last_flush: Instant::now(),
                seq: 0,
            }),
            log,
            max_concurrent,
            sync_interval,
            stats: RegistryStats::default(),
        };
        for s in &expired {
            registry.stats.record_terminal(s.status);
        }
        Ok(registry)
    }

    /// Admit a new Pending session for `user_id` if fewer than
    /// `max_concurrent` sessions are Pending or Active.
    pub fn admit(&self, user_id: &str, browser_session_id: Option<String>) -> Result<Session> {
        let mut inner = self.inner.lock();

        let running = inner.sessions.values().filter(|s| s.status.is_running()).count();
        if running >= self.max_concurrent {
            self.stats.rejected_busy.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::Busy {
                limit: self.max_concurrent,
            });
        }

        let now = Utc::now();
        let mut session_id = None;
        for _ in 0..1000 {
            inner.seq = inner.seq.wrapping_add(1);
            let candidate = session_id_for(user_id, now, inner.seq);
            if !inner.sessions.contains_key(&candidate) {
                session_id = Some(candidate);
                break;
            }
        }
        let session_id = session_id.ok_or_else(|| {
            EngineError::Internal(format!("no free session id for {} at {}", user_id, now))
        })?;

        let session = Session::new(session_id, user_id, browser_session_id, now);
        self.log.upsert(&session)?;
        inner
            .sessions
            .insert(session.session_id.clone(), session.clone());
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);

        info!(session_id = %session.session_id, user_id, running = running + 1, "admitted session");
        Ok(session)
    }

    /// Pending -> Active with the expected row count
    pub fn activate(&self, session_id: &str, total_rows: u64) -> Result<Session> {
        self.transition(session_id, SessionStatus::Active, |s, now| {
            s.total_rows = total_rows;
            s.last_progress_at = now;
        })
    }

    /// Record the column header
    pub fn set_columns(&self, session_id: &str, columns: Vec<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = get_mut(&mut inner, session_id)?;
        session.columns = columns;
        let snapshot = session.clone();
        self.log.upsert(&snapshot)?;
        inner.dirty.remove(session_id);
        Ok(())
    }

    /// Record streaming progress. `processed_rows` never decreases.
    pub fn progress(&self, session_id: &str, processed_rows: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = get_mut(&mut inner, session_id)?;
        if session.status != SessionStatus::Active {
            return Err(EngineError::Internal(format!(
                "progress on {} session {}",
                session.status, session_id
            )));
        }
        session.processed_rows = session.processed_rows.max(processed_rows);
        session.last_progress_at = Utc::now();
        inner.dirty.insert(session_id.to_string());

        if inner.last_flush.elapsed() >= self.sync_interval {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Active -> Completed
    pub fn complete(&self, session_id: &str, execution_time_s: f64) -> Result<Session> {
        self.transition(session_id, SessionStatus::Completed, |s, _| {
            s.execution_time_s = execution_time_s;
        })
    }

    /// Any running state -> Failed, recording `message`
    pub fn fail(&self, session_id: &str, message: &str) -> Result<Session> {
        let message = truncate_message(message, MAX_MESSAGE_LEN);
        self.transition(session_id, SessionStatus::Failed, move |s, _| {
            s.error_message = Some(message);
        })
    }

    /// Any running state -> Cancelled
    pub fn cancel(&self, session_id: &str) -> Result<Session> {
        self.transition(session_id, SessionStatus::Cancelled, |_, _| {})
    }

    /// Any running state -> TimedOut
    pub fn timeout(&self, session_id: &str, message: &str) -> Result<Session> {
        let message = truncate_message(message, MAX_MESSAGE_LEN);
        self.transition(session_id, SessionStatus::TimedOut, move |s, _| {
            s.error_message = Some(message);
        })
    }

    /// Look a session up and touch `last_accessed`
    pub fn lookup(&self, session_id: &str) -> Result<Session> {
        let mut inner = self.inner.lock();
        let session = get_mut(&mut inner, session_id)?;
        session.last_accessed = Utc::now();
        let snapshot = session.clone();
        inner.dirty.insert(session_id.to_string());
        Ok(snapshot)
    }

    /// Look a session up without touching it
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    /// Sessions of `user_id`, newest first
    pub fn list_for_user(&self, user_id: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.session_id.cmp(&a.session_id))
        });
        sessions
    }

    /// Every session
    pub fn snapshot(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Whether `session_id` is registered
    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().sessions.contains_key(session_id)
    }

    /// Sessions in Pending or Active
    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.status.is_running())
            .count()
    }

    /// Delete a session from the map and the log
    pub fn remove(&self, session_id: &str) -> Result<Option<Session>> {
        let mut inner = self.inner.lock();
        let removed = inner.sessions.remove(session_id);
        inner.dirty.remove(session_id);
        if removed.is_some() {
            self.log.delete(session_id)?;
            debug!(session_id, "removed session");
        }
        Ok(removed)
    }

    /// Write batched progress to the log
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    /// Get statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot::from(&self.stats)
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        let pending: Vec<Session> = inner
            .dirty
            .iter()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect();
        self.log.upsert_many(&pending)?;
        inner.dirty.clear();
        inner.last_flush = Instant::now();
        if !pending.is_empty() {
            debug!(sessions = pending.len(), "flushed session progress");
        }
        Ok(())
    }

    /// Apply a state transition and write it through.
    fn transition<F>(&self, session_id: &str, next: SessionStatus, apply: F) -> Result<Session>
    where
        F: FnOnce(&mut Session, DateTime<Utc>),
    {
        let mut inner = self.inner.lock();
        let session = get_mut(&mut inner, session_id)?;

        if !session.status.can_transition_to(next) {
            return Err(match next {
                SessionStatus::Cancelled => EngineError::NotCancellable {
                    session_id: session_id.to_string(),
                    status: session.status,
                },
                _ => EngineError::Internal(format!(
                    "invalid transition {} -> {} for {}",
                    session.status, next, session_id
                )),
            });
        }

        let now = Utc::now();
        session.status = next;
        session.last_accessed = now;
        apply(session, now);
        let snapshot = session.clone();

        self.log.upsert(&snapshot)?;
        inner.dirty.remove(session_id);
        self.stats.record_terminal(next);

        debug!(session_id, status = %next, "session transition");
        Ok(snapshot)
    }
}

fn get_mut<'a>(inner: &'a mut Inner, session_id: &str) -> Result<&'a mut Session> {
    inner
        .sessions
        .get_mut(session_id)
        .ok_or_else(|| EngineError::NotFound(session_id.to_string()))
}

/// Whether a running session has made no progress for longer than `timeout`
pub fn is_stale(session: &Session, timeout: Duration, now: DateTime<Utc>) -> bool {
    let idle = now.signed_duration_since(session.last_progress_at);
    idle.to_std().map(|d| d > timeout).unwrap_or(false)
}
