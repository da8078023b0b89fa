//! Connection pool for snowcache-upstream
//!
//! Bounded pool of warehouse connections with:
//! - At most `max_size` connections alive at once
//! - FIFO reuse of idle connections (the oldest idle connection goes out first)
//! - Reaping of connections idle longer than `idle_timeout`
//! - Shared use of the oldest leased connection when saturated, or bounded
//!   waiting (`acquire_timeout`) when sharing is switched off
//! - Matched lease/release accounting
//!
//! # Example
//!
//! ```rust,ignore
//! use snowcache_upstream::prelude::*;
//!
//! let pool = ConnectionPool::new(PoolConfig::new("snowflake://acct/db"), factory);
//! let lease = pool.acquire().await?;
//! let cursor = lease.connection().execute("SELECT 1").await?;
//! // The connection returns to the pool when `lease` is dropped
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a lease when the pool is saturated
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
    /// Lend the oldest leased connection instead of waiting when saturated
    pub reuse_oldest_when_saturated: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800), // 30 minutes
            test_on_borrow: false,
            reuse_oldest_when_saturated: true,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Use a fully specified connection configuration
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }

    /// Enable/disable sharing the oldest connection when saturated
    pub fn with_reuse_oldest_when_saturated(mut self, reuse: bool) -> Self {
        self.reuse_oldest_when_saturated = reuse;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Leases handed out
    pub leases_issued: u64,
    /// Leases returned
    pub leases_released: u64,
    /// Leases that shared an already leased connection
    pub leases_shared: u64,
    /// Number of times an acquire timed out
    pub exhausted_count: u64,
    /// Idle connections closed for exceeding the idle timeout
    pub idle_reaped: u64,
    /// Total wait time for leases (in milliseconds)
    pub total_wait_time_ms: u64,
}

impl PoolStats {
    /// Leases currently outstanding
    pub fn leases_outstanding(&self) -> u64 {
        self.leases_issued.saturating_sub(self.leases_released)
    }
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub leases_issued: AtomicU64,
    pub leases_released: AtomicU64,
    pub leases_shared: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub idle_reaped: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lease handed out
    pub fn record_lease(&self, wait_time_ms: u64) {
        self.leases_issued.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a lease that shares a leased connection
    pub fn record_shared(&self) {
        self.leases_shared.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lease returned
    pub fn record_release(&self) {
        self.leases_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an idle connection reaped
    pub fn record_reaped(&self) {
        self.idle_reaped.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            leases_issued: self.leases_issued.load(Ordering::Relaxed),
            leases_released: self.leases_released.load(Ordering::Relaxed),
            leases_shared: self.leases_shared.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            idle_reaped: self.idle_reaped.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }
}

/// Pool entry with bookkeeping
struct PoolEntry {
    conn_id: u64,
    conn: Arc<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
    query_count: Arc<AtomicU64>,
}

impl PoolEntry {
    fn share(&self) -> SharedEntry {
        SharedEntry {
            conn_id: self.conn_id,
            conn: Arc::clone(&self.conn),
            created_at: self.created_at,
            query_count: Arc::clone(&self.query_count),
        }
    }
}

/// Handle on a leased connection, kept so a saturated pool can lend it again
#[derive(Clone)]
struct SharedEntry {
    conn_id: u64,
    conn: Arc<dyn Connection>,
    created_at: Instant,
    query_count: Arc<AtomicU64>,
}

/// Bounded connection pool.
///
/// A semaphore with `max_size` permits caps the number of connections; every
/// exclusive lease owns one permit until it is dropped. Once all permits are
/// out, further leases share the oldest leased connection (unless
/// `reuse_oldest_when_saturated` is off, in which case they wait). Releases
/// always match acquisitions.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections, oldest first
    idle: Mutex<VecDeque<PoolEntry>>,
    /// Connections held by exclusive leases, in creation order
    leased: Mutex<Vec<SharedEntry>>,
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    next_conn_id: AtomicU64,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl ConnectionPool {
    /// Create a new, empty connection pool. Connections are opened lazily.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(VecDeque::with_capacity(config.max_size)),
            leased: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of live connections (idle + leased)
    pub fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of connections currently leased
    pub fn in_use(&self) -> usize {
        self.config
            .max_size
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Lease a connection.
    ///
    /// Reuses the oldest healthy idle connection, otherwise opens a new one.
    /// When all `max_size` connections are leased, the oldest of them is
    /// lent again as a shared lease. With `reuse_oldest_when_saturated` off,
    /// waits at most `acquire_timeout` before failing with
    /// [`Error::PoolExhausted`].
    pub async fn acquire(self: &Arc<Self>) -> Result<Lease> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is shut down".to_string(),
            });
        }

        let start = Instant::now();

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(Error::PoolExhausted {
                    message: "pool semaphore closed".to_string(),
                })
            }
            Err(TryAcquireError::NoPermits) => {
                if self.config.reuse_oldest_when_saturated {
                    if let Some(lease) = self.share_oldest() {
                        return Ok(lease);
                    }
                }
                self.wait_for_permit().await?
            }
        };

        let entry = loop {
            let candidate = self.idle.lock().pop_front();
            let Some(entry) = candidate else {
                break None;
            };
            if entry.last_used.elapsed() > self.config.idle_timeout {
                self.discard(entry, true).await;
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                warn!(conn_id = entry.conn_id, "discarding connection that failed validation");
                self.discard(entry, false).await;
                continue;
            }
            break Some(entry);
        };

        // Permit is released on early return.
        let entry = match entry {
            Some(e) => e,
            None => self.create_entry().await?,
        };

        let wait_ms = start.elapsed().as_millis() as u64;
        self.stats.record_lease(wait_ms);
        debug!(conn_id = entry.conn_id, wait_ms, "connection leased");

        let shared = entry.share();
        {
            let mut leased = self.leased.lock();
            let at = leased.partition_point(|e| e.conn_id < shared.conn_id);
            leased.insert(at, shared.clone());
        }

        Ok(Lease {
            conn: shared.conn,
            conn_id: shared.conn_id,
            created_at: shared.created_at,
            query_count: shared.query_count,
            entry: Some(entry),
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    async fn wait_for_permit(&self) -> Result<OwnedSemaphorePermit> {
        tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_exhausted();
            Error::PoolExhausted {
                message: format!(
                    "timeout waiting for connection ({}ms)",
                    self.config.acquire_timeout.as_millis()
                ),
            }
        })?
        .map_err(|_| Error::PoolExhausted {
            message: "pool semaphore closed".to_string(),
        })
    }

    /// Lend the oldest leased connection without taking a permit
    fn share_oldest(self: &Arc<Self>) -> Option<Lease> {
        let shared = self.leased.lock().first()?.clone();

        self.stats.record_lease(0);
        self.stats.record_shared();
        debug!(conn_id = shared.conn_id, "pool saturated, sharing oldest connection");

        Some(Lease {
            conn: shared.conn,
            conn_id: shared.conn_id,
            created_at: shared.created_at,
            query_count: shared.query_count,
            entry: None,
            pool: Arc::clone(self),
            permit: None,
        })
    }

    /// Close idle connections that exceeded the idle timeout. Returns how many were closed.
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<PoolEntry> = {
            let mut idle = self.idle.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = idle
                .drain(..)
                .partition(|e| e.last_used.elapsed() > self.config.idle_timeout);
            idle.extend(keep);
            expired
        };
        let count = expired.len();
        for entry in expired {
            self.discard(entry, true).await;
        }
        if count > 0 {
            debug!(count, "reaped idle upstream connections");
        }
        count
    }

    /// Close all idle connections and refuse further leases.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let drained: Vec<PoolEntry> = self.idle.lock().drain(..).collect();
        for entry in drained {
            self.discard(entry, false).await;
        }
        Ok(())
    }

    async fn create_entry(&self) -> Result<PoolEntry> {
        let timeout = Duration::from_millis(self.config.connection.connect_timeout_ms);
        let connect = self.factory.connect(&self.config.connection);
        let conn = if timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::timeout(format!("connect exceeded {}ms", timeout.as_millis())))??
        };

        let conn: Arc<dyn Connection> = Arc::from(conn);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Release);
        self.stats.record_created();
        debug!(conn_id, driver = %self.factory.driver(), "opened upstream connection");

        let now = Instant::now();
        Ok(PoolEntry {
            conn_id,
            conn,
            created_at: now,
            last_used: now,
            query_count: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn discard(&self, entry: PoolEntry, reaped: bool) {
        if let Err(e) = entry.conn.close().await {
            warn!(conn_id = entry.conn_id, error = %e, "error closing upstream connection");
        }
        self.total_connections.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
        if reaped {
            self.stats.record_reaped();
        }
    }

    fn give_back(&self, mut entry: PoolEntry) {
        self.leased.lock().retain(|e| e.conn_id != entry.conn_id);
        self.stats.record_release();
        entry.last_used = Instant::now();
        if self.shutdown.load(Ordering::Acquire) {
            // Dropped without close(); drivers release resources on drop.
            self.total_connections.fetch_sub(1, Ordering::Release);
            self.stats.record_closed();
            return;
        }
        self.idle.lock().push_back(entry);
    }
}

/// A connection leased from the pool. Returned to the pool exactly once, on drop.
///
/// An exclusive lease owns its pool entry and a permit. A shared lease, handed
/// out while the pool is saturated, only borrows the connection of the oldest
/// exclusive lease.
pub struct Lease {
    conn: Arc<dyn Connection>,
    conn_id: u64,
    created_at: Instant,
    query_count: Arc<AtomicU64>,
    entry: Option<PoolEntry>,
    pool: Arc<ConnectionPool>,
    // Dropped after `entry` has been handed back.
    permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// Get the underlying connection
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Pool-assigned connection id
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Whether this lease shares a connection held by another lease
    pub fn is_shared(&self) -> bool {
        self.permit.is_none()
    }

    /// Statements run on this connection over its lifetime
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Age of the underlying connection
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Count one statement against this connection
    pub fn record_query(&mut self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match self.entry.take() {
            Some(entry) => self.pool.give_back(entry),
            None => self.pool.stats.record_release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("snowflake://acct/db")
            .with_max_size(4)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_idle_timeout(Duration::from_secs(60))
            .with_test_on_borrow(true)
            .with_reuse_oldest_when_saturated(false);

        assert_eq!(config.max_size, 4);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.test_on_borrow);
        assert!(!config.reuse_oldest_when_saturated);
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert!(config.reuse_oldest_when_saturated);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_lease(100);
        stats.record_lease(200);
        stats.record_release();
        stats.record_closed();
        stats.record_exhausted();
        stats.record_reaped();
        stats.record_shared();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.leases_issued, 2);
        assert_eq!(snapshot.leases_released, 1);
        assert_eq!(snapshot.leases_outstanding(), 1);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.idle_reaped, 1);
        assert_eq!(snapshot.leases_shared, 1);
    }
}
