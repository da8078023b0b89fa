//! Upstream gateway
//!
//! The engine's only view of the warehouse. Three operations:
//! - `count`: row count of a statement, via `SELECT COUNT(*) FROM (<stmt>)`
//! - `open_cursor`: execute a statement and stream it in fixed-size chunks
//! - `test`: `SELECT 1` round trip
//!
//! Every round trip is bounded by the RPC timeout. Leases taken from the pool
//! are released on every path: `count` and `test` drop theirs before
//! returning, a [`ChunkStream`] holds its lease until it is closed or dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::RowCursor;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, Lease, PoolStats};
use crate::security::{count_statement, strip_statement_terminator};
use crate::types::{ColumnMetadata, Row};

/// Default rows per fetch
pub const DEFAULT_CHUNK_ROWS: usize = 2000;

/// Default per-call RPC timeout
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway over a connection pool
pub struct UpstreamGateway {
    pool: Arc<ConnectionPool>,
    chunk_rows: usize,
    rpc_timeout: Duration,
}

impl UpstreamGateway {
    /// Create a gateway with default chunk size and RPC timeout
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            chunk_rows: DEFAULT_CHUNK_ROWS,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Set rows per fetch (minimum 1)
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows.max(1);
        self
    }

    /// Set per-call RPC timeout (zero disables it)
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Rows per fetch
    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Row count of `stmt`
    pub async fn count(&self, stmt: &str) -> Result<i64> {
        let sql = count_statement(stmt);
        let mut lease = self.pool.acquire().await?;
        lease.record_query();

        let mut cursor = rpc(self.rpc_timeout, "count", lease.connection().execute(&sql)).await?;
        let fetched = rpc(self.rpc_timeout, "count fetch", cursor.fetch_many(1)).await;
        close_cursor(cursor.as_mut()).await;
        drop(lease);

        let rows = fetched?;
        let total = rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::generic("count query returned no scalar"))?;
        if total < 0 {
            return Err(Error::generic(format!("count query returned {}", total)));
        }
        debug!(total, "counted upstream rows");
        Ok(total)
    }

    /// Execute `stmt` and return its column names plus a chunked row stream.
    ///
    /// The stream owns the connection lease until closed.
    pub async fn open_cursor(&self, stmt: &str) -> Result<(Vec<String>, ChunkStream)> {
        let sql = strip_statement_terminator(stmt);
        let mut lease = self.pool.acquire().await?;
        lease.record_query();

        let cursor = rpc(self.rpc_timeout, "execute", lease.connection().execute(sql)).await?;
        let columns = cursor.columns().iter().map(|c| c.name.clone()).collect();
        debug!(conn_id = lease.conn_id(), "opened upstream cursor");

        Ok((
            columns,
            ChunkStream {
                cursor: Some(cursor),
                lease: Some(lease),
                chunk_rows: self.chunk_rows,
                rpc_timeout: self.rpc_timeout,
                rows_fetched: 0,
            },
        ))
    }

    /// `SELECT 1` round trip
    pub async fn test(&self) -> bool {
        match self.count_one().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "upstream health check failed");
                false
            }
        }
    }

    async fn count_one(&self) -> Result<()> {
        let mut lease = self.pool.acquire().await?;
        lease.record_query();
        let mut cursor = rpc(self.rpc_timeout, "test", lease.connection().execute("SELECT 1")).await?;
        let rows = rpc(self.rpc_timeout, "test fetch", cursor.fetch_many(1)).await;
        close_cursor(cursor.as_mut()).await;
        match rows?.first().and_then(|r| r.first()).and_then(|v| v.as_i64()) {
            Some(1) => Ok(()),
            other => Err(Error::generic(format!("SELECT 1 returned {:?}", other))),
        }
    }

    /// Close idle connections past the idle timeout
    pub async fn reap_idle(&self) -> usize {
        self.pool.reap_idle().await
    }

    /// Close the pool
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await
    }
}

/// Rows of an executed statement, fetched `chunk_rows` at a time
pub struct ChunkStream {
    cursor: Option<Box<dyn RowCursor>>,
    // Dropped after the cursor.
    lease: Option<Lease>,
    chunk_rows: usize,
    rpc_timeout: Duration,
    rows_fetched: u64,
}

impl ChunkStream {
    /// Column descriptions of the result set
    pub fn column_metadata(&self) -> &[ColumnMetadata] {
        self.cursor.as_ref().map(|c| c.columns()).unwrap_or(&[])
    }

    /// Rows handed out so far
    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched
    }

    /// Whether the stream still holds its connection lease
    pub fn is_open(&self) -> bool {
        self.lease.is_some()
    }

    /// Next chunk, or `None` once the cursor is exhausted or closed.
    ///
    /// The cursor is closed automatically when it runs dry.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<Row>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let rows = rpc(self.rpc_timeout, "fetch", cursor.fetch_many(self.chunk_rows)).await?;
        if rows.is_empty() {
            self.close().await;
            return Ok(None);
        }
        self.rows_fetched += rows.len() as u64;
        Ok(Some(rows))
    }

    /// Close the cursor and release the lease. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            close_cursor(cursor.as_mut()).await;
        }
        if let Some(lease) = self.lease.take() {
            debug!(conn_id = lease.conn_id(), rows = self.rows_fetched, "released upstream cursor");
        }
    }
}

async fn close_cursor(cursor: &mut dyn RowCursor) {
    if let Err(e) = cursor.close().await {
        warn!(error = %e, "error closing upstream cursor");
    }
}

async fn rpc<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "{} exceeded {}ms",
            op,
            timeout.as_millis()
        ))),
    }
}
