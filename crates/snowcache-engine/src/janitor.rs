//! Periodic session sweep
//!
//! Each pass, in order:
//! 1. time out running sessions without progress for `active_timeout`
//! 2. drop tables of Failed and TimedOut sessions, remove sessions past their
//!    retention window (or older than `max_session_age`)
//! 3. drop cache tables that no session owns
//! 4. flush batched progress to the session log

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::ExecutionCoordinator;
use crate::error::Result;
use crate::registry::is_stale;
use crate::session::{Session, SessionStatus};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Running sessions moved to TimedOut
    pub timed_out: usize,
    /// Sessions removed from the registry
    pub expired: usize,
    /// Tables of Failed/TimedOut sessions dropped ahead of retention
    pub tables_dropped: usize,
    /// Tables without a session
    pub orphans_dropped: usize,
    /// Idle upstream connections closed
    pub idle_connections_reaped: usize,
    /// Items skipped because cleaning them up failed
    pub failures: usize,
}

impl SweepReport {
    /// Whether the sweep changed anything
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Timed sweeper over the coordinator's sessions
pub struct Janitor {
    coordinator: Arc<ExecutionCoordinator>,
}

impl Janitor {
    /// Create a janitor
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Sweep once as of `now`. Does not touch the upstream pool.
    ///
    /// A session or table that cannot be cleaned up is logged, counted in
    /// `failures` and retried on the next pass; the rest of the sweep and the
    /// final flush still run.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let config = self.coordinator.config();
        let registry = self.coordinator.registry();
        let store = self.coordinator.store();

        for session in registry.snapshot() {
            if session.status.is_running() && is_stale(&session, config.active_timeout, now) {
                // The session may have settled since the snapshot.
                match self.time_out(&session) {
                    Ok(()) => report.timed_out += 1,
                    Err(e) => debug!(session_id = %session.session_id, error = %e, "skipped timeout"),
                }
            }
        }

        for session in registry.snapshot() {
            let id = session.session_id.as_str();
            if self.expired(&session, now) {
                match self.coordinator.cleanup(id) {
                    Ok(()) => {
                        debug!(session_id = id, status = %session.status, "expired session");
                        report.expired += 1;
                    }
                    Err(e) => {
                        warn!(session_id = id, error = %e, "failed to remove expired session");
                        report.failures += 1;
                    }
                }
                continue;
            }
            if matches!(session.status, SessionStatus::Failed | SessionStatus::TimedOut)
                && !self.coordinator.is_streaming(id)
            {
                let dropped = store.table_exists(id).and_then(|found| {
                    if found {
                        store.drop_table(id)?;
                    }
                    Ok(found)
                });
                match dropped {
                    Ok(true) => report.tables_dropped += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(session_id = id, error = %e, "failed to drop cache table");
                        report.failures += 1;
                    }
                }
            }
        }

        let known: HashSet<String> = registry
            .snapshot()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        match store.list_cache_tables() {
            Ok(tables) => {
                for table in tables.into_iter().filter(|t| !known.contains(t)) {
                    warn!(table = %table, "dropping orphan cache table");
                    match store.drop_table(&table) {
                        Ok(()) => report.orphans_dropped += 1,
                        Err(e) => {
                            warn!(table = %table, error = %e, "failed to drop orphan cache table");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to list cache tables");
                report.failures += 1;
            }
        }

        registry.flush()?;
        Ok(report)
    }

    /// Sweep now and reap idle upstream connections
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = self.sweep_at(Utc::now())?;
        report.idle_connections_reaped = self.coordinator.gateway().reap_idle().await;
        if report.is_empty() {
            debug!("sweep found nothing to do");
        } else {
            info!(
                timed_out = report.timed_out,
                expired = report.expired,
                tables_dropped = report.tables_dropped,
                orphans_dropped = report.orphans_dropped,
                idle_connections_reaped = report.idle_connections_reaped,
                failures = report.failures,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `token` is cancelled
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("janitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "sweep failed");
                        }
                    }
                }
            }
        })
    }

    fn time_out(&self, session: &Session) -> Result<()> {
        let id = session.session_id.as_str();
        let message = format!(
            "no progress for more than {}s",
            self.coordinator.config().active_timeout.as_secs()
        );
        self.coordinator.registry().timeout(id, &message)?;
        // A live stream sees the signal and drops its own table.
        self.coordinator.progress().cancel(id);
        if !self.coordinator.is_streaming(id) {
            self.coordinator.store().drop_table(id)?;
        }
        warn!(session_id = id, user_id = %session.user_id, "timed out stale session");
        Ok(())
    }

    fn expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        let config = self.coordinator.config();
        if older_than(session.created_at, now, config.max_session_age) {
            return true;
        }
        let retention = match session.status {
            SessionStatus::Cancelled => return true,
            SessionStatus::Completed => config.retention_completed,
            SessionStatus::Failed => config.retention_failed,
            SessionStatus::TimedOut => config.retention_timed_out,
            SessionStatus::Pending | SessionStatus::Active => return false,
        };
        older_than(session.last_accessed, now, retention)
    }
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .map(|age| age > window)
        .unwrap_or(false)
}
