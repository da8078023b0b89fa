use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::Database;
use crate::error::{EngineError, Result};
use crate::session::{Session, SessionStatus};

const CREATE_SESSIONS: &str = "
CREATE TABLE IF NOT EXISTS snowcache_sessions (
  session_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  last_accessed TEXT NOT NULL,
  last_progress_at TEXT NOT NULL,
  status TEXT NOT NULL,
  total_rows INTEGER NOT NULL,
  processed_rows INTEGER NOT NULL,
  execution_time_s REAL NOT NULL,
  error_message TEXT,
  browser_session_id TEXT,
  columns TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS snowcache_sessions_user ON snowcache_sessions (user_id);
";

const UPSERT: &str = "
INSERT INTO snowcache_sessions (
  session_id, user_id, created_at, last_accessed, last_progress_at, status,
  total_rows, processed_rows, execution_time_s, error_message, browser_session_id, columns
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(session_id) DO UPDATE SET
  last_accessed = excluded.last_accessed,
  last_progress_at = excluded.last_progress_at,
  status = excluded.status,
  total_rows = excluded.total_rows,
  processed_rows = excluded.processed_rows,
  execution_time_s = excluded.execution_time_s,
  error_message = excluded.error_message,
  columns = excluded.columns
";

/// Durable copy of the session registry, kept in the store file
pub struct SessionLog {
    db: Arc<Database>,
}

impl SessionLog {
    pub(super) fn new(db: Arc<Database>) -> Result<Self> {
        db.write(|conn| conn.execute_batch(CREATE_SESSIONS))?;
        Ok(Self { db })
    }

    /// Insert or update one session
    pub fn upsert(&self, session: &Session) -> Result<()> {
        self.upsert_many(std::slice::from_ref(session))
    }

    /// Insert or update sessions in one transaction
    pub fn upsert_many(&self, sessions: &[Session]) -> Result<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let encoded = sessions
            .iter()
            .map(|s| serde_json::to_string(&s.columns).map(|c| (s, c)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Internal(format!("encode columns: {}", e)))?;

        self.db.write(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT)?;
                for (s, columns) in &encoded {
                    stmt.execute(params![
                        s.session_id,
                        s.user_id,
                        s.created_at.to_rfc3339(),
                        s.last_accessed.to_rfc3339(),
                        s.last_progress_at.to_rfc3339(),
                        s.status.as_str(),
                        s.total_rows as i64,
                        s.processed_rows as i64,
                        s.execution_time_s,
                        s.error_message,
                        s.browser_session_id,
                        columns,
                    ])?;
                }
            }
            tx.commit()
        })
    }

    /// Delete a session row
    pub fn delete(&self, session_id: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "DELETE FROM snowcache_sessions WHERE session_id = ?1",
                [session_id],
            )
        })?;
        Ok(())
    }

    /// Every stored session, oldest first
    pub fn load_all(&self) -> Result<Vec<Session>> {
        let raw = self.db.write(load_rows)?;
        raw.into_iter().map(RawSession::decode).collect()
    }
}

struct RawSession {
    session_id: String,
    user_id: String,
    created_at: String,
    last_accessed: String,
    last_progress_at: String,
    status: String,
    total_rows: i64,
    processed_rows: i64,
    execution_time_s: f64,
    error_message: Option<String>,
    browser_session_id: Option<String>,
    columns: String,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            user_id: row.get(1)?,
            created_at: row.get(2)?,
            last_accessed: row.get(3)?,
            last_progress_at: row.get(4)?,
            status: row.get(5)?,
            total_rows: row.get(6)?,
            processed_rows: row.get(7)?,
            execution_time_s: row.get(8)?,
            error_message: row.get(9)?,
            browser_session_id: row.get(10)?,
            columns: row.get(11)?,
        })
    }

    fn decode(self) -> Result<Session> {
        let columns: Vec<String> = serde_json::from_str(&self.columns).map_err(|e| {
            EngineError::Internal(format!("{}: corrupt column header: {}", self.session_id, e))
        })?;
        Ok(Session {
            created_at: parse_ts(&self.session_id, &self.created_at)?,
            last_accessed: parse_ts(&self.session_id, &self.last_accessed)?,
            last_progress_at: parse_ts(&self.session_id, &self.last_progress_at)?,
            status: self.status.parse::<SessionStatus>()?,
            total_rows: self.total_rows.max(0) as u64,
            processed_rows: self.processed_rows.max(0) as u64,
            execution_time_s: self.execution_time_s,
            error_message: self.error_message,
            browser_session_id: self.browser_session_id,
            columns,
            user_id: self.user_id,
            session_id: self.session_id,
        })
    }
}

fn load_rows(conn: &mut Connection) -> rusqlite::Result<Vec<RawSession>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, user_id, created_at, last_accessed, last_progress_at, status,
                total_rows, processed_rows, execution_time_s, error_message, browser_session_id, columns
         FROM snowcache_sessions ORDER BY created_at, session_id",
    )?;
    let rows = stmt.query_map([], RawSession::from_row)?;
    rows.collect()
}

fn parse_ts(session_id: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Internal(format!("{}: bad timestamp '{}': {}", session_id, raw, e)))
}
