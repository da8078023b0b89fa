//! Execution coordinator
//!
//! Drives one statement from admission to a populated cache table:
//!
//! 1. validate the statement
//! 2. admit a Pending session (concurrency cap)
//! 3. count rows upstream
//! 4. apply the size gates (`too_large`, `requires_confirmation`)
//! 5. activate the session and start progress tracking
//! 6. stream chunks from the upstream cursor into the cache table
//! 7. complete, or fail/cancel and drop the table
//!
//! Steps 1-5 always run in the caller's task. Step 6 runs inline for
//! [`ExecutionCoordinator::execute`] and on a spawned task for
//! [`ExecutionCoordinator::execute_async`]. The upstream cursor is closed on
//! every path.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Seek, Write};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use snowcache_upstream::gateway::ChunkStream;
use snowcache_upstream::types::Row;
use snowcache_upstream::UpstreamGateway;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::export::{
    sanitize_filename, ExportEncoder, ExportFormat, ExportRequest, ExportSummary,
    DEFAULT_FILENAME_PREFIX,
};
use crate::progress::ProgressTracker;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionStatus};
use crate::store::{CacheStore, Page, PageQuery, ScanQuery, UniqueValues};
use crate::validator::StatementValidator;

/// Per-request execution options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    /// Cache at most this many rows
    pub limit: Option<u64>,
    /// Skip the display gate; the hard size gate still applies
    pub download_only: bool,
    /// Caller's browser session
    pub browser_session_id: Option<String>,
}

impl ExecuteOptions {
    /// Options with a row limit
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Download-only execution
    pub fn download_only(mut self) -> Self {
        self.download_only = true;
        self
    }

    /// Attach a browser session id
    pub fn with_browser_session(mut self, id: impl Into<String>) -> Self {
        self.browser_session_id = Some(id.into());
        self
    }
}

/// Result of an execute call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecuteOutcome {
    /// Rows are cached and readable
    Completed {
        /// Session id
        session_id: String,
        /// Rows expected
        total: u64,
        /// Rows cached
        processed: u64,
        /// Wall-clock seconds from admission to completion
        execution_time_s: f64,
        /// Original column names
        columns: Vec<String>,
    },
    /// Streaming continues in the background
    Processing {
        /// Session id
        session_id: String,
        /// Rows expected
        total: u64,
        /// Human-readable note
        message: String,
    },
    /// Too many rows to display; resubmit as download-only
    RequiresConfirmation {
        /// Rows the statement returns
        total_count: u64,
        /// Display limit that was exceeded
        limit: u64,
        /// Human-readable note
        message: String,
    },
}

impl ExecuteOutcome {
    /// Session id, when a session holds the rows
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Completed { session_id, .. } | Self::Processing { session_id, .. } => {
                Some(session_id)
            }
            Self::RequiresConfirmation { .. } => None,
        }
    }
}

/// Status payload of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Session id
    pub session_id: String,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Rows expected
    pub total: u64,
    /// Rows cached
    pub processed: u64,
    /// Completion percentage
    pub progress_pct: f64,
    /// Failure reason
    pub error: Option<String>,
    /// Original column names
    pub columns: Vec<String>,
    /// Execution time, once completed
    pub execution_time_s: f64,
}

impl From<&Session> for StatusReport {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            status: s.status,
            total: s.total_rows,
            processed: s.processed_rows,
            progress_pct: s.progress_pct(),
            error: s.error_message.clone(),
            columns: s.columns.clone(),
            execution_time_s: s.execution_time_s,
        }
    }
}

/// Bytes of a finished export
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutput {
    /// Filename, type and row count
    pub summary: ExportSummary,
    /// Encoded file
    pub bytes: Vec<u8>,
}

/// An admitted, activated execution waiting to stream
struct Job {
    session_id: String,
    stmt: String,
    total: u64,
    limited: bool,
    token: CancellationToken,
    started: Instant,
}

enum Prepared {
    Ready(Job),
    Gated(ExecuteOutcome),
}

enum StreamEnd {
    Done(u64),
    Cancelled(u64),
}

struct StreamReport {
    processed: u64,
    execution_time_s: f64,
    columns: Vec<String>,
}

/// Marks a session as being streamed until dropped
struct StreamingGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl<'a> StreamingGuard<'a> {
    fn new(set: &'a Mutex<HashSet<String>>, session_id: &str) -> Self {
        set.lock().insert(session_id.to_string());
        Self {
            set,
            session_id: session_id.to_string(),
        }
    }
}

impl Drop for StreamingGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.session_id);
    }
}

/// Orchestrates gateway, cache store, registry and progress tracker
pub struct ExecutionCoordinator {
    config: EngineConfig,
    gateway: UpstreamGateway,
    store: Arc<CacheStore>,
    registry: Arc<SessionRegistry>,
    progress: Arc<ProgressTracker>,
    validator: Arc<dyn StatementValidator>,
    workers: Semaphore,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    streaming: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl ExecutionCoordinator {
    /// Wire the components together
    pub fn new(
        config: EngineConfig,
        gateway: UpstreamGateway,
        store: Arc<CacheStore>,
        registry: Arc<SessionRegistry>,
        progress: Arc<ProgressTracker>,
        validator: Arc<dyn StatementValidator>,
    ) -> Self {
        let workers = Semaphore::new(config.upstream_workers.max(1));
        Self {
            config,
            gateway,
            store,
            registry,
            progress,
            validator,
            workers,
            tasks: Mutex::new(HashMap::new()),
            streaming: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Upstream gateway
    pub fn gateway(&self) -> &UpstreamGateway {
        &self.gateway
    }

    /// Cache store
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Progress tracker
    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Whether a task is currently streaming `session_id`
    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.streaming.lock().contains(session_id)
    }

    /// Execute and wait until every row is cached
    pub async fn execute(&self, stmt: &str, user_id: &str, limit: Option<u64>) -> Result<ExecuteOutcome> {
        let options = ExecuteOptions {
            limit,
            ..ExecuteOptions::default()
        };
        self.execute_with(stmt, user_id, &options).await
    }

    /// Execute with explicit options and wait until every row is cached
    pub async fn execute_with(
        &self,
        stmt: &str,
        user_id: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteOutcome> {
        let job = match self.prepare(stmt, user_id, options).await? {
            Prepared::Ready(job) => job,
            Prepared::Gated(outcome) => return Ok(outcome),
        };
        let session_id = job.session_id.clone();
        let total = job.total;
        let report = self.run(job).await?;
        Ok(ExecuteOutcome::Completed {
            session_id,
            total,
            processed: report.processed,
            execution_time_s: report.execution_time_s,
            columns: report.columns,
        })
    }

    /// Admit and gate inline, then stream on a background task.
    ///
    /// Returns as soon as the session is Active.
    pub async fn execute_async(
        self: &Arc<Self>,
        stmt: &str,
        user_id: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteOutcome> {
        let job = match self.prepare(stmt, user_id, options).await? {
            Prepared::Ready(job) => job,
            Prepared::Gated(outcome) => return Ok(outcome),
        };
        self.prune_finished();

        let session_id = job.session_id.clone();
        let total = job.total;
        let this = Arc::clone(self);
        let task_id = session_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.run(job).await {
                debug!(session_id = %task_id, error = %e, "background execution ended with an error");
            }
        });
        self.tasks.lock().insert(session_id.clone(), handle);

        Ok(ExecuteOutcome::Processing {
            session_id,
            total,
            message: format!("caching {} rows in the background", total),
        })
    }

    /// Validate, admit, count, gate and activate
    async fn prepare(&self, stmt: &str, user_id: &str, options: &ExecuteOptions) -> Result<Prepared> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Internal("engine is shutting down".to_string()));
        }
        self.validator
            .validate(stmt)
            .map_err(EngineError::Validation)?;

        let started = Instant::now();
        let session = self
            .registry
            .admit(user_id, options.browser_session_id.clone())?;
        let session_id = session.session_id;

        let counted = match self.count(stmt).await {
            Ok(n) => n,
            Err(e) => {
                self.record_failure(&session_id, &e);
                return Err(e);
            }
        };
        let total = options.limit.map_or(counted, |limit| counted.min(limit));

        if total > self.config.max_for_csv {
            let err = EngineError::TooLarge {
                total,
                cap: self.config.max_for_csv,
            };
            warn!(session_id = %session_id, total, "result set too large to cache");
            self.registry.fail(&session_id, &err.message())?;
            return Err(err);
        }

        if total > self.config.max_for_display && !options.download_only {
            // Releases the concurrency slot; the caller may resubmit as download-only.
            self.registry.cancel(&session_id)?;
            info!(session_id = %session_id, total, "result set needs confirmation");
            return Ok(Prepared::Gated(ExecuteOutcome::RequiresConfirmation {
                total_count: total,
                limit: self.config.max_for_display,
                message: format!(
                    "query returns {} rows, more than the {} that can be displayed; confirm to download",
                    total, self.config.max_for_display
                ),
            }));
        }

        if let Err(e) = self.registry.activate(&session_id, total) {
            // A cancel can land between admission and activation.
            return Err(match self.registry.get(&session_id) {
                Some(s) if s.status == SessionStatus::Cancelled => EngineError::Cancelled(session_id),
                _ => e,
            });
        }
        let token = self.progress.create(&session_id, total);
        info!(session_id = %session_id, user_id, total, "session active");

        Ok(Prepared::Ready(Job {
            session_id,
            stmt: stmt.to_string(),
            total,
            limited: options.limit.is_some(),
            token,
            started,
        }))
    }

    async fn count(&self, stmt: &str) -> Result<u64> {
        let _permit = self.worker().await?;
        let n = self.gateway.count(stmt).await?;
        Ok(n.max(0) as u64)
    }

    async fn worker(&self) -> Result<SemaphorePermit<'_>> {
        self.workers
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("upstream worker pool closed".to_string()))
    }

    /// Stream the job and settle the session
    async fn run(&self, job: Job) -> Result<StreamReport> {
        let _guard = StreamingGuard::new(&self.streaming, &job.session_id);
        let id = job.session_id.as_str();

        let streamed = self.stream(&job).await;
        let end = match streamed {
            Ok((end, _)) if job.token.is_cancelled() => StreamEnd::Cancelled(processed_of(&end)),
            Ok((end, columns)) => match end {
                StreamEnd::Done(processed) => {
                    let elapsed = job.started.elapsed().as_secs_f64();
                    match self.registry.complete(id, elapsed) {
                        Ok(_) => {
                            self.progress.complete(id, processed);
                            info!(
                                session_id = id,
                                rows = processed,
                                elapsed_ms = (elapsed * 1000.0) as u64,
                                "execution completed"
                            );
                            return Ok(StreamReport {
                                processed,
                                execution_time_s: elapsed,
                                columns,
                            });
                        }
                        Err(_) if self.was_cancelled(id) => StreamEnd::Cancelled(processed),
                        Err(e) => {
                            self.record_failure(id, &e);
                            return Err(e);
                        }
                    }
                }
                cancelled => cancelled,
            },
            Err(_) if job.token.is_cancelled() || self.was_cancelled(id) => {
                StreamEnd::Cancelled(self.registry.get(id).map_or(0, |s| s.processed_rows))
            }
            Err(e) => {
                self.record_failure(id, &e);
                return Err(e);
            }
        };

        self.record_cancel(id, processed_of(&end));
        Err(EngineError::Cancelled(job.session_id.clone()))
    }

    /// Open the cursor, create the table and pump chunks. Always closes the
    /// cursor.
    async fn stream(&self, job: &Job) -> Result<(StreamEnd, Vec<String>)> {
        let opened = {
            let _permit = self.worker().await?;
            tokio::select! {
                biased;
                _ = job.token.cancelled() => None,
                opened = self.gateway.open_cursor(&job.stmt) => Some(opened?),
            }
        };
        let Some((columns, mut cursor)) = opened else {
            return Ok((StreamEnd::Cancelled(0), Vec::new()));
        };

        let pumped = self.pump(job, &columns, &mut cursor).await;
        cursor.close().await;
        pumped.map(|end| (end, columns))
    }

    async fn pump(&self, job: &Job, columns: &[String], cursor: &mut ChunkStream) -> Result<StreamEnd> {
        let id = job.session_id.as_str();
        self.registry.set_columns(id, columns.to_vec())?;
        self.store.create_table(id, columns)?;

        let mut processed = 0u64;
        loop {
            if job.token.is_cancelled() {
                return Ok(StreamEnd::Cancelled(processed));
            }
            if processed >= job.total && (job.limited || job.total > 0) {
                break;
            }

            let fetch = async {
                let _permit = self.worker().await?;
                cursor.next_chunk().await.map_err(EngineError::from)
            };
            let next = tokio::select! {
                biased;
                _ = job.token.cancelled() => return Ok(StreamEnd::Cancelled(processed)),
                next = fetch => next?,
            };
            let Some(mut rows) = next else { break };

            if job.total > 0 || job.limited {
                let remaining = job.total - processed;
                if rows.len() as u64 > remaining {
                    if !job.limited {
                        warn!(session_id = id, counted = job.total, "upstream returned more rows than counted; truncating");
                    }
                    rows.truncate(remaining as usize);
                }
            }

            let inserted = self.append(id, rows).await? as u64;
            processed += inserted;
            self.registry.progress(id, processed)?;
            self.progress.update(id, processed);
            debug!(session_id = id, rows = inserted, processed, "cached chunk");

            tokio::task::yield_now().await;
        }
        Ok(StreamEnd::Done(processed))
    }

    async fn append(&self, session_id: &str, rows: Vec<Row>) -> Result<usize> {
        let store = Arc::clone(&self.store);
        let id = session_id.to_string();
        tokio::task::spawn_blocking(move || store.append_chunk(&id, &rows))
            .await
            .map_err(|e| EngineError::Internal(format!("append task failed: {}", e)))?
    }

    fn was_cancelled(&self, session_id: &str) -> bool {
        match self.registry.get(session_id) {
            Some(s) => s.status == SessionStatus::Cancelled,
            None => true,
        }
    }

    /// Failed: record the message, mark progress and drop the table
    fn record_failure(&self, session_id: &str, err: &EngineError) {
        let message = err.message();
        error!(session_id, code = err.code().as_str(), error = %message, "execution failed");
        if let Err(e) = self.registry.fail(session_id, &message) {
            warn!(session_id, error = %e, "could not record failure");
        }
        self.progress.error(session_id, &message);
        if let Err(e) = self.store.drop_table(session_id) {
            warn!(session_id, error = %e, "could not drop cache table after failure");
        }
    }

    /// Cancelled: drop the table and settle the registry if nobody has yet
    fn record_cancel(&self, session_id: &str, processed: u64) {
        if let Err(e) = self.store.drop_table(session_id) {
            warn!(session_id, error = %e, "could not drop cache table after cancel");
        }
        match self.registry.cancel(session_id) {
            Ok(_) | Err(EngineError::NotCancellable { .. }) | Err(EngineError::NotFound(_)) => {}
            Err(e) => warn!(session_id, error = %e, "could not record cancel"),
        }
        self.progress.cancel(session_id);
        info!(session_id, rows = processed, "execution cancelled");
    }

    /// Look a session up for reading
    fn readable(&self, session_id: &str) -> Result<Session> {
        let session = self.registry.lookup(session_id)?;
        if session.is_readable() {
            return Ok(session);
        }
        match session.status {
            SessionStatus::Pending | SessionStatus::Active => {
                Err(EngineError::NotReady(session.session_id))
            }
            SessionStatus::Cancelled => Err(EngineError::Cancelled(session.session_id)),
            status => Err(EngineError::NoData {
                session_id: session.session_id,
                status,
            }),
        }
    }

    /// One page of cached rows. `page_size` is capped at `max_page_size`.
    pub fn read(&self, session_id: &str, query: &PageQuery) -> Result<Page> {
        let session = self.readable(session_id)?;
        let mut query = query.clone();
        query.page = query.page.max(1);
        query.page_size = query.page_size.clamp(1, self.config.max_page_size);
        self.store.read_page(session_id, &session.columns, &query)
    }

    /// Distinct values of `column`. `limit` is capped at `max_unique_limit`.
    pub fn unique_values(
        &self,
        session_id: &str,
        column: &str,
        limit: usize,
        scan: &ScanQuery,
    ) -> Result<UniqueValues> {
        let session = self.readable(session_id)?;
        let limit = limit.clamp(1, self.config.max_unique_limit);
        self.store
            .unique_values(session_id, &session.columns, column, limit, scan)
    }

    /// Status of a session
    pub fn status(&self, session_id: &str) -> Result<StatusReport> {
        let session = self.registry.lookup(session_id)?;
        Ok(StatusReport::from(&session))
    }

    /// Sessions of one user, newest first
    pub fn list_sessions(&self, user_id: &str) -> Vec<Session> {
        self.registry.list_for_user(user_id)
    }

    /// Cancel a running session.
    ///
    /// The streaming task observes the signal between chunks and drops the
    /// table; without a task the table is dropped here.
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Err(EngineError::NotCancellable {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }

        self.progress.cancel(session_id);
        self.registry.cancel(session_id)?;
        if !self.is_streaming(session_id) {
            self.store.drop_table(session_id)?;
        }
        info!(session_id, processed = session.processed_rows, "cancel requested");
        Ok(())
    }

    /// Export cached rows into `out`
    pub fn export_to<W: Write + Seek>(
        &self,
        session_id: &str,
        request: &ExportRequest,
        out: W,
    ) -> Result<(ExportSummary, W)> {
        let session = self.readable(session_id)?;
        let header = &session.columns;
        let format = request.format;

        let (what, cap) = match format {
            ExportFormat::Csv | ExportFormat::Tsv => ("csv", self.config.max_for_csv),
            ExportFormat::Clipboard => ("clipboard", self.config.max_for_clipboard),
            ExportFormat::Xlsx => ("excel", self.config.max_for_excel),
        };
        let actual = self.store.count_matching(session_id, header, &request.scan)?;
        if actual > cap {
            return Err(EngineError::LimitExceeded { what, cap, actual });
        }

        let chart = match (&request.chart, format) {
            (Some(spec), ExportFormat::Xlsx) if actual <= self.config.max_for_excel_chart => {
                Some(spec.resolve(header)?)
            }
            (Some(_), ExportFormat::Xlsx) => {
                info!(
                    session_id,
                    rows = actual,
                    cap = self.config.max_for_excel_chart,
                    "too many rows for a chart; exporting without it"
                );
                None
            }
            _ => None,
        };

        let mut encoder = ExportEncoder::new(format, header, chart, out)?;
        self.store
            .scan(session_id, header, &request.scan, |row| encoder.write_row(row))?;
        let rows = encoder.rows_written();
        let chart_embedded = encoder.has_chart();
        let out = encoder.finish()?;

        let summary = ExportSummary {
            filename: sanitize_filename(
                request.filename.as_deref(),
                DEFAULT_FILENAME_PREFIX,
                format.extension(),
                Utc::now(),
            ),
            content_type: format.content_type().to_string(),
            rows,
            chart_embedded,
        };
        info!(session_id, format = %format, rows, "exported session");
        Ok((summary, out))
    }

    /// Export cached rows into memory
    pub fn export(&self, session_id: &str, request: &ExportRequest) -> Result<ExportOutput> {
        let (summary, cursor) = self.export_to(session_id, request, Cursor::new(Vec::new()))?;
        Ok(ExportOutput {
            summary,
            bytes: cursor.into_inner(),
        })
    }

    /// Stop a session if running, drop its table and forget it.
    ///
    /// Unknown ids are ignored.
    pub fn cleanup(&self, session_id: &str) -> Result<()> {
        if let Some(session) = self.registry.get(session_id) {
            if session.status.is_running() {
                self.progress.cancel(session_id);
                match self.registry.cancel(session_id) {
                    Ok(_) | Err(EngineError::NotCancellable { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.store.drop_table(session_id)?;
        self.registry.remove(session_id)?;
        self.progress.delete(session_id);
        debug!(session_id, "cleaned up session");
        Ok(())
    }

    /// Clean up every session of `user_id`; returns how many were removed
    pub fn cleanup_user(&self, user_id: &str) -> Result<usize> {
        let sessions = self.registry.list_for_user(user_id);
        for session in &sessions {
            self.cleanup(&session.session_id)?;
        }
        if !sessions.is_empty() {
            info!(user_id, sessions = sessions.len(), "cleaned up user sessions");
        }
        Ok(sessions.len())
    }

    /// Wait for a background execution to finish. Returns immediately when
    /// none is running for `session_id`.
    pub async fn join(&self, session_id: &str) -> Result<()> {
        let handle = self.tasks.lock().remove(session_id);
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| EngineError::Internal(format!("execution task failed: {}", e)))?;
        }
        Ok(())
    }

    /// Forget handles of finished background executions
    pub fn prune_finished(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, handle| !handle.is_finished());
        before - tasks.len()
    }

    /// Background executions not yet joined
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Refuse new work, cancel running executions and wait for them
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let signalled = self.progress.cancel_all();
        let handles: Vec<(String, JoinHandle<()>)> = self.tasks.lock().drain().collect();
        for (session_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(session_id = %session_id, error = %e, "execution task ended abnormally");
            }
        }
        self.registry.flush()?;
        info!(cancelled = signalled, "coordinator stopped");
        Ok(())
    }
}

fn processed_of(end: &StreamEnd) -> u64 {
    match end {
        StreamEnd::Done(n) | StreamEnd::Cancelled(n) => *n,
    }
}
