//! Engine root
//!
//! Owns every long-lived component (store, registry, progress tracker, pool,
//! coordinator, janitor). Nothing is global: tests open a fresh engine on a
//! temporary file.

use std::io::{Seek, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snowcache_upstream::connection::{ConnectionConfig, ConnectionFactory};
use snowcache_upstream::pool::{ConnectionPool, PoolConfig, PoolStats};
use snowcache_upstream::UpstreamGateway;

use crate::config::EngineConfig;
use crate::coordinator::{
    ExecuteOptions, ExecuteOutcome, ExecutionCoordinator, ExportOutput, StatusReport,
};
use crate::error::Result;
use crate::export::{ExportRequest, ExportSummary};
use crate::janitor::{Janitor, SweepReport};
use crate::progress::ProgressTracker;
use crate::registry::{RegistryStatsSnapshot, SessionRegistry};
use crate::session::Session;
use crate::store::{self, Page, PageQuery, ScanQuery, UniqueValues};
use crate::validator::{SelectOnlyValidator, StatementValidator};

/// Engine-wide counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Session lifecycle counters
    pub registry: RegistryStatsSnapshot,
    /// Upstream pool counters
    pub pool: PoolStats,
    /// Sessions in the registry
    pub sessions: usize,
    /// Sessions in Pending or Active
    pub running: usize,
    /// Background executions not yet joined
    pub background_tasks: usize,
}

struct JanitorHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Query execution and result cache engine
pub struct Engine {
    coordinator: Arc<ExecutionCoordinator>,
    janitor: Arc<Janitor>,
    janitor_task: Mutex<Option<JanitorHandle>>,
}

impl Engine {
    /// Open the store, recover the registry and build the upstream pool.
    /// Statements are checked by [`SelectOnlyValidator`].
    pub fn open(
        config: EngineConfig,
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
    ) -> Result<Self> {
        Self::open_with_validator(config, factory, connection, Arc::new(SelectOnlyValidator))
    }

    /// Like [`Engine::open`] with a caller-supplied statement validator
    pub fn open_with_validator(
        config: EngineConfig,
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
        validator: Arc<dyn StatementValidator>,
    ) -> Result<Self> {
        config.validate()?;

        let (cache, log) = store::open(&config.db_path)?;
        let registry = SessionRegistry::recover(
            log,
            config.max_concurrent,
            config.sync_interval,
            config.active_timeout,
            Utc::now(),
        )?;

        let pool = ConnectionPool::new(
            PoolConfig::default()
                .with_connection(connection)
                .with_max_size(config.max_pool),
            factory,
        );
        let gateway = UpstreamGateway::new(pool)
            .with_chunk_rows(config.chunk_rows)
            .with_rpc_timeout(config.rpc_timeout);

        info!(
            db_path = %config.db_path.display(),
            max_concurrent = config.max_concurrent,
            max_pool = config.max_pool,
            chunk_rows = config.chunk_rows,
            "engine opened"
        );

        let coordinator = Arc::new(ExecutionCoordinator::new(
            config,
            gateway,
            Arc::new(cache),
            Arc::new(registry),
            Arc::new(ProgressTracker::new()),
            validator,
        ));
        let janitor = Arc::new(Janitor::new(Arc::clone(&coordinator)));

        Ok(Self {
            coordinator,
            janitor,
            janitor_task: Mutex::new(None),
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &EngineConfig {
        self.coordinator.config()
    }

    /// The coordinator, for callers that need component access
    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    /// Execute and wait for every row to be cached
    pub async fn execute(&self, stmt: &str, user_id: &str, limit: Option<u64>) -> Result<ExecuteOutcome> {
        self.coordinator.execute(stmt, user_id, limit).await
    }

    /// Execute with options and wait for every row to be cached
    pub async fn execute_with(
        &self,
        stmt: &str,
        user_id: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteOutcome> {
        self.coordinator.execute_with(stmt, user_id, options).await
    }

    /// Execute, streaming in the background
    pub async fn execute_async(
        &self,
        stmt: &str,
        user_id: &str,
        options: &ExecuteOptions,
    ) -> Result<ExecuteOutcome> {
        self.coordinator.execute_async(stmt, user_id, options).await
    }

    /// One page of a cached result
    pub fn read(&self, session_id: &str, query: &PageQuery) -> Result<Page> {
        self.coordinator.read(session_id, query)
    }

    /// Distinct values of one column
    pub fn unique_values(
        &self,
        session_id: &str,
        column: &str,
        limit: usize,
        scan: &ScanQuery,
    ) -> Result<UniqueValues> {
        self.coordinator.unique_values(session_id, column, limit, scan)
    }

    /// Session status
    pub fn status(&self, session_id: &str) -> Result<StatusReport> {
        self.coordinator.status(session_id)
    }

    /// Cancel a running session
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        self.coordinator.cancel(session_id)
    }

    /// Export into memory
    pub fn export(&self, session_id: &str, request: &ExportRequest) -> Result<ExportOutput> {
        self.coordinator.export(session_id, request)
    }

    /// Export into a writer
    pub fn export_to<W: Write + Seek>(
        &self,
        session_id: &str,
        request: &ExportRequest,
        out: W,
    ) -> Result<(ExportSummary, W)> {
        self.coordinator.export_to(session_id, request, out)
    }

    /// Drop one session and its cache table
    pub fn cleanup(&self, session_id: &str) -> Result<()> {
        self.coordinator.cleanup(session_id)
    }

    /// Drop every session of a user
    pub fn cleanup_user(&self, user_id: &str) -> Result<usize> {
        self.coordinator.cleanup_user(user_id)
    }

    /// Sessions of a user, newest first
    pub fn list_sessions(&self, user_id: &str) -> Vec<Session> {
        self.coordinator.list_sessions(user_id)
    }

    /// Wait for a background execution
    pub async fn join(&self, session_id: &str) -> Result<()> {
        self.coordinator.join(session_id).await
    }

    /// Run one janitor pass now
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.janitor.sweep().await
    }

    /// Run one janitor pass as of `now` (without reaping connections)
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.janitor.sweep_at(now)
    }

    /// Start the periodic janitor. No-op if already running.
    pub fn start_janitor(&self) {
        let mut slot = self.janitor_task.lock();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let interval = self.config().janitor_sweep;
        let task = Arc::clone(&self.janitor).spawn(interval, token.clone());
        info!(interval_s = interval.as_secs(), "janitor started");
        *slot = Some(JanitorHandle { token, task });
    }

    /// Upstream `SELECT 1` round trip
    pub async fn test_upstream(&self) -> bool {
        self.coordinator.gateway().test().await
    }

    /// Engine counters
    pub fn stats(&self) -> EngineStats {
        let registry = self.coordinator.registry();
        EngineStats {
            registry: registry.stats(),
            pool: self.coordinator.gateway().pool_stats(),
            sessions: registry.snapshot().len(),
            running: registry.running_count(),
            background_tasks: self.coordinator.pending_tasks(),
        }
    }

    /// Stop the janitor, cancel running executions, flush the registry and
    /// close the upstream pool
    pub async fn shutdown(&self) -> Result<()> {
        let janitor = self.janitor_task.lock().take();
        if let Some(handle) = janitor {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "janitor task ended abnormally");
            }
        }
        self.coordinator.shutdown().await?;
        self.coordinator.gateway().close().await?;
        info!("engine shut down");
        Ok(())
    }
}
