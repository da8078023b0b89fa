use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use snowcache_upstream::security::{quote_identifier, validate_sql_identifier};
use snowcache_upstream::types::Row;

use super::filter::{column_name, resolve_column, ExtendedFilter, WhereClause};
use super::Database;
use crate::error::{EngineError, Result};
use crate::session::SESSION_PREFIX;

/// Implicit insertion-order column of every cache table
const ROWID: &str = "__rowid";

/// Sort direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    /// Ascending
    #[default]
    Asc,
    /// Descending
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Filter and sort shared by page reads, unique values and export scans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanQuery {
    /// Column -> allowed values
    pub filters: BTreeMap<String, Vec<String>>,
    /// Predicates
    pub extended_filters: Vec<ExtendedFilter>,
    /// Sort column (original name); insertion order when absent
    pub sort_by: Option<String>,
    /// Sort direction
    pub sort_order: SortOrder,
}

/// A page request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageQuery {
    /// 1-based page number
    pub page: usize,
    /// Rows per page
    pub page_size: usize,
    /// Filters and sort
    #[serde(flatten)]
    pub scan: ScanQuery,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 100,
            scan: ScanQuery::default(),
        }
    }
}

impl PageQuery {
    /// Page `page` of `page_size` rows, unfiltered
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page,
            page_size,
            scan: ScanQuery::default(),
        }
    }

    /// Add an equality filter
    pub fn with_filter(mut self, column: impl Into<String>, values: Vec<String>) -> Self {
        self.scan.filters.insert(column.into(), values);
        self
    }

    /// Add a predicate
    pub fn with_extended_filter(mut self, filter: ExtendedFilter) -> Self {
        self.scan.extended_filters.push(filter);
        self
    }

    /// Sort by a column
    pub fn with_sort(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.scan.sort_by = Some(column.into());
        self.scan.sort_order = order;
        self
    }
}

/// One page of cached rows. All cells are strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Rows of this page
    pub rows: Vec<Vec<String>>,
    /// Original column names
    pub columns: Vec<String>,
    /// Rows matching the filters
    pub total: u64,
    /// 1-based page number
    pub page: usize,
    /// Rows per page
    pub page_size: usize,
    /// Pages at this page size
    pub total_pages: u64,
}

/// Distinct values of one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueValues {
    /// Up to `limit` distinct non-null values, sorted
    pub values: Vec<String>,
    /// Distinct non-null values overall
    pub total_count: u64,
    /// More values exist than were returned
    pub is_truncated: bool,
}

/// Per-session cache tables
pub struct CacheStore {
    db: Arc<Database>,
}

impl CacheStore {
    pub(super) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create the cache table for `session_id` with one TEXT column per header
    /// entry. Idempotent for the same width.
    pub fn create_table(&self, session_id: &str, columns: &[String]) -> Result<String> {
        let table = table_ident(session_id)?;
        if columns.is_empty() {
            return Err(EngineError::Internal(format!(
                "{}: result set has no columns",
                session_id
            )));
        }

        let defs: Vec<String> = (0..columns.len())
            .map(|i| format!("{} TEXT NOT NULL", column_name(i)))
            .collect();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY, {})",
            table,
            ROWID,
            defs.join(", ")
        );
        self.db.write(|conn| conn.execute(&ddl, []))?;

        let width = self.width(session_id)?;
        if width != columns.len() {
            return Err(EngineError::Internal(format!(
                "{}: existing cache table has {} columns, expected {}",
                session_id,
                width,
                columns.len()
            )));
        }
        debug!(session_id, columns = columns.len(), "created cache table");
        Ok(session_id.to_string())
    }

    /// Append a chunk in one transaction; returns rows inserted.
    ///
    /// Every value is converted before anything is written, so a chunk that
    /// violates the cell policy leaves the table untouched.
    pub fn append_chunk(&self, session_id: &str, rows: &[Row]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = table_ident(session_id)?;
        let width = rows[0].len();

        let mut cells: Vec<Vec<String>> = Vec::with_capacity(rows.len());
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(EngineError::Internal(format!(
                    "{}: row {} has {} values, expected {}",
                    session_id,
                    idx,
                    row.len(),
                    width
                )));
            }
            let converted = row
                .iter()
                .map(|v| v.to_cell())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            cells.push(converted);
        }

        let cols: Vec<String> = (0..width).map(column_name).collect();
        let placeholders: Vec<String> = (1..=width).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            cols.join(", "),
            placeholders.join(", ")
        );

        let inserted = self.db.write(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in &cells {
                    stmt.execute(params_from_iter(row.iter()))?;
                }
            }
            tx.commit()?;
            Ok(cells.len())
        })?;
        Ok(inserted)
    }

    /// Read one page under `query`, resolving column names against `header`.
    pub fn read_page(&self, session_id: &str, header: &[String], query: &PageQuery) -> Result<Page> {
        let table = table_ident(session_id)?;
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let clause = WhereClause::build(header, &query.scan.filters, &query.scan.extended_filters)?;
        let order = order_by(header, &query.scan)?;

        let count_sql = format!("SELECT COUNT(*) FROM {}{}", table, clause.sql());
        let select_sql = format!(
            "SELECT {} FROM {}{}{} LIMIT {} OFFSET {}",
            select_list(header.len()),
            table,
            clause.sql(),
            order,
            page_size,
            (page - 1).saturating_mul(page_size)
        );

        let (total, rows) = self.db.read(|conn| {
            // One read transaction so count and rows come from the same snapshot.
            let tx = conn.transaction()?;
            let total: i64 =
                tx.query_row(&count_sql, params_from_iter(clause.params().iter()), |r| r.get(0))?;
            let rows = collect_rows(&tx, &select_sql, clause.params(), header.len())?;
            tx.commit()?;
            Ok((total.max(0) as u64, rows))
        })?;

        Ok(Page {
            rows,
            columns: header.to_vec(),
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size as u64),
        })
    }

    /// Distinct non-null values of `column` under the filters of `scan`.
    pub fn unique_values(
        &self,
        session_id: &str,
        header: &[String],
        column: &str,
        limit: usize,
        scan: &ScanQuery,
    ) -> Result<UniqueValues> {
        let table = table_ident(session_id)?;
        let col = column_name(resolve_column(header, column)?);
        let mut clause = WhereClause::build(header, &scan.filters, &scan.extended_filters)?;
        clause.require_non_empty(&col);
        let limit = limit.max(1);

        let count_sql = format!("SELECT COUNT(DISTINCT {}) FROM {}{}", col, table, clause.sql());
        let values_sql = format!(
            "SELECT DISTINCT {col} FROM {table}{filter} ORDER BY {col} LIMIT {limit}",
            col = col,
            table = table,
            filter = clause.sql(),
            limit = limit
        );

        let (total_count, values) = self.db.read(|conn| {
            let tx = conn.transaction()?;
            let total: i64 =
                tx.query_row(&count_sql, params_from_iter(clause.params().iter()), |r| r.get(0))?;
            let values = {
                let mut stmt = tx.prepare(&values_sql)?;
                let rows = stmt.query_map(params_from_iter(clause.params().iter()), |r| {
                    r.get::<_, String>(0)
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;
            Ok((total.max(0) as u64, values))
        })?;

        Ok(UniqueValues {
            is_truncated: total_count > values.len() as u64,
            values,
            total_count,
        })
    }

    /// Rows matching `scan`
    pub fn count_matching(&self, session_id: &str, header: &[String], scan: &ScanQuery) -> Result<u64> {
        let table = table_ident(session_id)?;
        let clause = WhereClause::build(header, &scan.filters, &scan.extended_filters)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", table, clause.sql());
        let total: i64 = self.db.read(|conn| {
            conn.query_row(&sql, params_from_iter(clause.params().iter()), |r| r.get(0))
        })?;
        Ok(total.max(0) as u64)
    }

    /// Stream every row matching `scan` to `visit`, in sort order, from one
    /// snapshot. Returns rows visited.
    pub fn scan<F>(&self, session_id: &str, header: &[String], scan: &ScanQuery, mut visit: F) -> Result<u64>
    where
        F: FnMut(&[String]) -> Result<()>,
    {
        let table = table_ident(session_id)?;
        let clause = WhereClause::build(header, &scan.filters, &scan.extended_filters)?;
        let sql = format!(
            "SELECT {} FROM {}{}{}",
            select_list(header.len()),
            table,
            clause.sql(),
            order_by(header, scan)?
        );
        let width = header.len();

        let mut conn = self.reader_for_scan()?;
        let tx = conn.transaction()?;
        let mut visited = 0u64;
        {
            let mut stmt = tx.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(clause.params().iter()))?;
            let mut buf: Vec<String> = Vec::with_capacity(width);
            while let Some(row) = rows.next()? {
                buf.clear();
                for i in 0..width {
                    buf.push(row.get(i)?);
                }
                visit(&buf)?;
                visited += 1;
            }
        }
        tx.commit()?;
        Ok(visited)
    }

    /// Drop the cache table. No-op if it does not exist.
    pub fn drop_table(&self, session_id: &str) -> Result<()> {
        let table = table_ident(session_id)?;
        let sql = format!("DROP TABLE IF EXISTS {}", table);
        self.db.write(|conn| conn.execute(&sql, []))?;
        debug!(session_id, "dropped cache table");
        Ok(())
    }

    /// Whether a cache table exists
    pub fn table_exists(&self, session_id: &str) -> Result<bool> {
        let found = self.db.read(|conn| {
            conn.query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [session_id],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    /// Rows currently cached for a session
    pub fn row_count(&self, session_id: &str) -> Result<u64> {
        let table = table_ident(session_id)?;
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let n: i64 = self.db.read(|conn| conn.query_row(&sql, [], |r| r.get(0)))?;
        Ok(n.max(0) as u64)
    }

    /// Names of every cache table in the store
    pub fn list_cache_tables(&self) -> Result<Vec<String>> {
        let pattern = format!("{}%", SESSION_PREFIX.replace('_', "\\_"));
        let names = self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ESCAPE '\\' ORDER BY name",
            )?;
            let rows = stmt.query_map([&pattern], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(names)
    }

    fn width(&self, session_id: &str) -> Result<usize> {
        let table = table_ident(session_id)?;
        let sql = format!("SELECT * FROM {} LIMIT 0", table);
        // The writer sees its own DDL immediately.
        let n = self
            .db
            .write(|conn| conn.prepare(&sql).map(|stmt| stmt.column_count()))?;
        Ok(n.saturating_sub(1))
    }

    fn reader_for_scan(&self) -> Result<Connection> {
        self.db.open_reader()
    }
}

/// Validate and quote a session id used as a table name
fn table_ident(session_id: &str) -> Result<String> {
    validate_sql_identifier(session_id)
        .map_err(|e| EngineError::Internal(format!("invalid cache table name: {}", e)))?;
    if !session_id.starts_with(SESSION_PREFIX) {
        return Err(EngineError::Internal(format!(
            "invalid cache table name '{}': missing '{}' prefix",
            session_id, SESSION_PREFIX
        )));
    }
    Ok(quote_identifier(session_id))
}

fn select_list(width: usize) -> String {
    (0..width).map(column_name).collect::<Vec<_>>().join(", ")
}

fn order_by(header: &[String], scan: &ScanQuery) -> Result<String> {
    match &scan.sort_by {
        Some(column) => {
            let col = column_name(resolve_column(header, column)?);
            Ok(format!(
                " ORDER BY {} {}, {} ASC",
                col,
                scan.sort_order.sql(),
                ROWID
            ))
        }
        None => Ok(format!(" ORDER BY {} ASC", ROWID)),
    }
}

fn collect_rows(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
    width: usize,
) -> rusqlite::Result<Vec<Vec<String>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        (0..width).map(|i| row.get::<_, String>(i)).collect()
    })?;
    rows.collect()
}
