//! Shared helpers: a scripted in-memory warehouse and engine setup

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use snowcache_engine::{Engine, EngineConfig};
use snowcache_upstream::prelude::{
    ColumnMetadata, Connection, ConnectionConfig, ConnectionFactory, DriverKind, Error, Row,
    RowCursor, Value,
};

/// What the warehouse returns for one statement
#[derive(Clone, Default)]
pub struct Script {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Reported by the count query; defaults to `rows.len()`
    pub count: Option<i64>,
    /// Each fetch waits for one permit
    pub gate: Option<Arc<Semaphore>>,
    /// Fetch number (0-based) that fails
    pub fail_at: Option<usize>,
}

impl Script {
    pub fn new(columns: &[&str], rows: Vec<Row>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            ..Self::default()
        }
    }

    /// `n` rows of `(id, name)`
    pub fn numbered(n: usize) -> Self {
        let rows = (0..n)
            .map(|i| vec![Value::Int64(i as i64), Value::String(format!("row-{}", i))])
            .collect();
        Self::new(&["id", "name"], rows)
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_at(mut self, fetch: usize) -> Self {
        self.fail_at = Some(fetch);
        self
    }
}

/// Statement -> script, shared by every connection
#[derive(Default)]
pub struct Warehouse {
    scripts: Mutex<HashMap<String, Script>>,
    pub executed: AtomicU64,
}

impl Warehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, stmt: &str, script: Script) {
        self.scripts.lock().insert(stmt.to_string(), script);
    }

    fn lookup(&self, stmt: &str) -> Result<Script, Error> {
        self.scripts
            .lock()
            .get(stmt)
            .cloned()
            .ok_or_else(|| Error::syntax(format!("no such table in: {}", stmt)))
    }
}

pub struct ScriptedFactory {
    warehouse: Arc<Warehouse>,
}

impl ScriptedFactory {
    pub fn new(warehouse: Arc<Warehouse>) -> Arc<Self> {
        Arc::new(Self { warehouse })
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>, Error> {
        Ok(Box::new(ScriptedConnection {
            warehouse: Arc::clone(&self.warehouse),
        }))
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Custom
    }
}

struct ScriptedConnection {
    warehouse: Arc<Warehouse>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&self, sql: &str) -> Result<Box<dyn RowCursor>, Error> {
        self.warehouse.executed.fetch_add(1, Ordering::SeqCst);

        if sql == "SELECT 1" {
            return Ok(Box::new(ScriptedCursor::scalar("1", 1)));
        }
        if let Some(inner) = sql
            .strip_prefix("SELECT COUNT(*) FROM (\n")
            .and_then(|s| s.strip_suffix("\n) AS snowcache_count"))
        {
            let script = self.warehouse.lookup(inner)?;
            let count = script.count.unwrap_or(script.rows.len() as i64);
            return Ok(Box::new(ScriptedCursor::scalar("COUNT(*)", count)));
        }

        let script = self.warehouse.lookup(sql)?;
        Ok(Box::new(ScriptedCursor {
            columns: script.columns.iter().map(ColumnMetadata::new).collect(),
            rows: script.rows.into_iter().collect(),
            gate: script.gate,
            fail_at: script.fail_at,
            fetches: 0,
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

struct ScriptedCursor {
    columns: Vec<ColumnMetadata>,
    rows: VecDeque<Row>,
    gate: Option<Arc<Semaphore>>,
    fail_at: Option<usize>,
    fetches: usize,
}

impl ScriptedCursor {
    fn scalar(name: &str, value: i64) -> Self {
        Self {
            columns: vec![ColumnMetadata::new(name)],
            rows: VecDeque::from(vec![vec![Value::Int64(value)]]),
            gate: None,
            fail_at: None,
            fetches: 0,
        }
    }
}

#[async_trait]
impl RowCursor for ScriptedCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    async fn fetch_many(&mut self, max_rows: usize) -> Result<Vec<Row>, Error> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| Error::unavailable("gate closed"))?;
            permit.forget();
        }
        let fetch = self.fetches;
        self.fetches += 1;
        if self.fail_at == Some(fetch) {
            return Err(Error::unavailable("connection reset by peer"));
        }
        let n = max_rows.min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }
}

/// Small chunks and plenty of upstream workers so gated fetches never starve
/// the count queries of other sessions.
pub fn test_config(dir: &TempDir) -> EngineConfig {
    EngineConfig::default()
        .with_db_path(dir.path().join("cache.db"))
        .with_chunk_rows(10)
        .with_upstream_workers(16)
}

pub fn open_engine(config: EngineConfig, warehouse: &Arc<Warehouse>) -> Engine {
    Engine::open(
        config,
        ScriptedFactory::new(Arc::clone(warehouse)),
        ConnectionConfig::new("scripted://warehouse"),
    )
    .unwrap()
}

/// Poll `check` until it holds, for up to five seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
