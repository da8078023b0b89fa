//! SQLite upstream driver
//!
//! A [`ConnectionFactory`] over a local SQLite file, for development, the CLI
//! and tests. Statements run on the blocking thread pool; the full result set
//! is read once and served to the cursor in chunks.
//!
//! Connection URLs: `sqlite:///abs/path.db`, `sqlite://rel/path.db`, a bare
//! path, or `sqlite::memory:`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::OpenFlags;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DriverKind, RowCursor};
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Row, Value};

/// Where a SQLite upstream lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    /// Private in-memory database
    Memory,
    /// Database file
    File(PathBuf),
}

impl SqliteTarget {
    /// Parse a connection URL
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        match rest {
            "" => Err(Error::config("sqlite URL has no path")),
            ":memory:" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }
}

/// Factory for read-only SQLite upstream connections
#[derive(Debug, Default, Clone)]
pub struct SqliteConnectionFactory;

impl SqliteConnectionFactory {
    /// Create a new factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let target = SqliteTarget::parse(&config.url)?;
        let busy = Duration::from_millis(config.query_timeout_ms);

        let conn = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection> {
            let conn = match &target {
                SqliteTarget::Memory => rusqlite::Connection::open_in_memory(),
                SqliteTarget::File(path) => rusqlite::Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                ),
            }
            .map_err(|e| Error::unavailable_with_source("failed to open sqlite upstream", e))?;
            conn.busy_timeout(busy)
                .map_err(|e| Error::unavailable_with_source("failed to configure sqlite", e))?;
            Ok(conn)
        })
        .await
        .map_err(|e| Error::generic(format!("sqlite connect task failed: {}", e)))??;

        debug!("opened sqlite upstream connection");
        Ok(Box::new(SqliteConnection {
            inner: Arc::new(Mutex::new(conn)),
        }))
    }

    fn driver(&self) -> DriverKind {
        DriverKind::Sqlite
    }
}

/// One SQLite upstream connection
pub struct SqliteConnection {
    inner: Arc<Mutex<rusqlite::Connection>>,
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&self, sql: &str) -> Result<Box<dyn RowCursor>> {
        let inner = Arc::clone(&self.inner);
        let sql = sql.to_string();
        let (columns, rows) = tokio::task::spawn_blocking(move || run_query(&inner.lock(), &sql))
            .await
            .map_err(|e| Error::generic(format!("sqlite query task failed: {}", e)))??;
        Ok(Box::new(SqliteCursor { columns, rows }))
    }

    async fn is_valid(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner
                .lock()
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        // The handle closes when the last Arc drops.
        Ok(())
    }
}

struct SqliteCursor {
    columns: Vec<ColumnMetadata>,
    rows: VecDeque<Row>,
}

#[async_trait]
impl RowCursor for SqliteCursor {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    async fn fetch_many(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let n = max_rows.min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

fn run_query(conn: &rusqlite::Connection, sql: &str) -> Result<(Vec<ColumnMetadata>, VecDeque<Row>)> {
    let mut stmt = conn.prepare(sql).map_err(|e| map_error(e, sql))?;
    let columns: Vec<ColumnMetadata> = stmt
        .column_names()
        .into_iter()
        .map(ColumnMetadata::new)
        .collect();
    let width = columns.len();

    let mut out = VecDeque::new();
    let mut rows = stmt.query([]).map_err(|e| map_error(e, sql))?;
    while let Some(row) = rows.next().map_err(|e| map_error(e, sql))? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            let value = row.get_ref(idx).map_err(|e| map_error(e, sql))?;
            values.push(convert(value));
        }
        out.push_back(values);
    }
    Ok((columns, out))
}

fn convert(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int64(n),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn map_error(e: rusqlite::Error, sql: &str) -> Error {
    let message = e.to_string();
    let is_parse_error = ["syntax error", "no such table", "no such column", "incomplete input"]
        .iter()
        .any(|needle| message.contains(needle));
    if is_parse_error {
        return Error::syntax_with_sql(message, sql);
    }
    let unavailable = matches!(
        e.sqlite_error_code(),
        Some(
            rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::CannotOpen
        )
    );
    if unavailable {
        Error::unavailable_with_source(message, e)
    } else {
        Error::generic_with_source(message, e)
    }
}
