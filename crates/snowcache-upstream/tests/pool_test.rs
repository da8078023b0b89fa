//! Tests for snowcache-upstream pool module

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snowcache_upstream::prelude::*;

struct EmptyCursor {
    columns: Vec<ColumnMetadata>,
}

#[async_trait]
impl RowCursor for EmptyCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    async fn fetch_many(&mut self, _max_rows: usize) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }
}

struct CountingConnection;

#[async_trait]
impl Connection for CountingConnection {
    async fn execute(&self, _sql: &str) -> Result<Box<dyn RowCursor>> {
        Ok(Box::new(EmptyCursor {
            columns: vec![ColumnMetadata::new("x")],
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CountingFactory {
    opened: AtomicU64,
}

#[async_trait]
impl ConnectionFactory for CountingFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingConnection))
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Custom
    }
}

fn pool(config: PoolConfig) -> (Arc<ConnectionPool>, Arc<CountingFactory>) {
    let factory = Arc::new(CountingFactory::default());
    (ConnectionPool::new(config, factory.clone()), factory)
}

// ==================== PoolConfig Tests ====================

#[test]
fn test_pool_config_new() {
    let config = PoolConfig::new("snowflake://acct/db");

    assert_eq!(config.connection.url, "snowflake://acct/db");
    assert_eq!(config.max_size, 10);
    assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    assert_eq!(config.idle_timeout, Duration::from_secs(1800));
    assert!(!config.test_on_borrow);
    assert!(config.reuse_oldest_when_saturated);
}

// ==================== Lease Tests ====================

#[tokio::test]
async fn test_lazy_creation_and_reuse() {
    let (pool, factory) = pool(PoolConfig::new("mock://"));
    assert_eq!(pool.size(), 0);

    let first_id = {
        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 1);
        lease.conn_id()
    };
    assert_eq!(pool.idle(), 1);
    assert_eq!(pool.in_use(), 0);

    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.conn_id(), first_id);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_oldest_idle_reused_first() {
    let (pool, _) = pool(PoolConfig::new("mock://"));

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.conn_id(), b.conn_id());
    assert_ne!(a_id, b_id);

    drop(a);
    drop(b);

    let next = pool.acquire().await.unwrap();
    assert_eq!(next.conn_id(), a_id);
}

#[tokio::test]
async fn test_query_count_tracked_per_connection() {
    let (pool, _) = pool(PoolConfig::new("mock://"));
    {
        let mut lease = pool.acquire().await.unwrap();
        lease.record_query();
        lease.record_query();
    }
    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.query_count(), 2);
}

#[tokio::test]
async fn test_lease_exposes_connection() {
    let (pool, _) = pool(PoolConfig::new("mock://"));
    let mut lease = pool.acquire().await.unwrap();
    assert!(!lease.is_shared());

    let mut cursor = lease.connection().execute("SELECT 1").await.unwrap();
    lease.record_query();
    assert_eq!(cursor.columns()[0].name, "x");
    assert!(cursor.fetch_many(10).await.unwrap().is_empty());
    assert_eq!(lease.query_count(), 1);
    assert!(lease.age() < Duration::from_secs(5));
}

// ==================== Saturation Tests ====================

#[tokio::test]
async fn test_saturated_pool_shares_oldest_connection() {
    let (pool, factory) = pool(
        PoolConfig::new("mock://")
            .with_max_size(2)
            .with_acquire_timeout(Duration::from_millis(50)),
    );

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    assert_eq!(pool.in_use(), 2);

    let mut extra = pool.acquire().await.unwrap();
    assert!(extra.is_shared());
    assert!(!a.is_shared());
    assert_eq!(extra.conn_id(), a.conn_id());
    assert_ne!(extra.conn_id(), b.conn_id());
    extra.record_query();
    assert_eq!(a.query_count(), 1);

    let cursor = extra.connection().execute("SELECT 1").await.unwrap();
    assert_eq!(cursor.columns().len(), 1);

    assert_eq!(pool.size(), 2);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().exhausted_count, 0);
    assert_eq!(pool.stats().leases_shared, 1);

    drop(extra);
    drop(b);
    drop(a);
    let stats = pool.stats();
    assert_eq!(stats.leases_issued, 3);
    assert_eq!(stats.leases_outstanding(), 0);
    assert_eq!(pool.idle(), 2);
}

#[tokio::test]
async fn test_shared_lease_picks_oldest_connection() {
    let (pool, _) = pool(PoolConfig::new("mock://").with_max_size(2));

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.conn_id(), b.conn_id());

    // b was leased last but a is the older connection
    drop(a);
    let a = pool.acquire().await.unwrap();
    assert_eq!(a.conn_id(), a_id);
    assert_eq!(pool.acquire().await.unwrap().conn_id(), a_id);

    // a freed permit is taken exclusively again
    drop(b);
    let next = pool.acquire().await.unwrap();
    assert!(!next.is_shared());
    assert_eq!(next.conn_id(), b_id);
}

// ==================== Exhaustion Tests ====================

#[tokio::test]
async fn test_exhaustion_fails_after_acquire_timeout() {
    let (pool, _) = pool(
        PoolConfig::new("mock://")
            .with_max_size(2)
            .with_acquire_timeout(Duration::from_millis(50))
            .with_reuse_oldest_when_saturated(false),
    );

    let _a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    assert_eq!(pool.in_use(), 2);

    let err = match pool.acquire().await {
        Err(e) => e,
        Ok(_) => panic!("third lease must not be granted"),
    };
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(err.is_retriable());
    assert_eq!(pool.stats().exhausted_count, 1);
    assert_eq!(pool.size(), 2);
}

#[tokio::test]
async fn test_waiter_gets_released_lease() {
    let (pool, factory) = pool(
        PoolConfig::new("mock://")
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_reuse_oldest_when_saturated(false),
    );

    let held = pool.acquire().await.unwrap();
    let held_id = held.conn_id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|l| l.conn_id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
}

// ==================== Accounting Tests ====================

#[tokio::test]
async fn test_leases_balance() {
    let (pool, _) = pool(PoolConfig::new("mock://").with_max_size(3));

    for _ in 0..10 {
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(b);
        drop(a);
    }

    let stats = pool.stats();
    assert_eq!(stats.leases_issued, 20);
    assert_eq!(stats.leases_released, 20);
    assert_eq!(stats.leases_outstanding(), 0);
    assert!(stats.connections_created <= 3);
}

#[tokio::test]
async fn test_idle_reaping() {
    let (pool, _) = pool(PoolConfig::new("mock://").with_idle_timeout(Duration::from_millis(10)));

    drop(pool.acquire().await.unwrap());
    assert_eq!(pool.idle(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(pool.reap_idle().await, 1);
    assert_eq!(pool.size(), 0);

    let stats = pool.stats();
    assert_eq!(stats.idle_reaped, 1);
    assert_eq!(stats.connections_closed, 1);
}

#[tokio::test]
async fn test_expired_idle_replaced_on_acquire() {
    let (pool, factory) =
        pool(PoolConfig::new("mock://").with_idle_timeout(Duration::from_millis(10)));

    let first = pool.acquire().await.unwrap().conn_id();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let lease = pool.acquire().await.unwrap();
    assert_ne!(lease.conn_id(), first);
    assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    assert_eq!(pool.size(), 1);
}

#[tokio::test]
async fn test_closed_pool_refuses_leases() {
    let (pool, _) = pool(PoolConfig::new("mock://"));
    drop(pool.acquire().await.unwrap());

    pool.close().await.unwrap();
    assert_eq!(pool.idle(), 0);
    assert!(pool.acquire().await.is_err());
}
