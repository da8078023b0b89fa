//! Embedded store
//!
//! One SQLite file (WAL mode) holds the durable session log and every cache
//! table. Writes go through a single writer connection; reads borrow a
//! connection from a small reader pool so readers of different sessions never
//! wait on each other, and WAL snapshots keep readers off a writer's
//! uncommitted chunk.

mod cache;
pub mod filter;
mod session_log;

pub use cache::{CacheStore, Page, PageQuery, ScanQuery, SortOrder, UniqueValues};
pub use filter::{ExtendedFilter, FilterOp};
pub use session_log::SessionLog;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_READERS: usize = 8;

/// Shared handle to the store file
pub(crate) struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl Database {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let writer = Connection::open(path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        debug!(path = %path.display(), "opened cache store");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Run `op` on the writer connection, retrying once on busy/locked.
    pub(crate) fn write<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.writer.lock();
        retry_once(|| op(&mut conn))
    }

    /// Run `op` on a pooled reader connection, retrying once on busy/locked.
    pub(crate) fn read<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = match self.readers.lock().pop() {
            Some(conn) => conn,
            None => self.open_reader()?,
        };
        let result = retry_once(|| op(&mut conn));
        let mut readers = self.readers.lock();
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }
        result
    }

    fn open_reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

fn retry_once<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(e) if EngineError::is_transient_store_error(&e) => {
            warn!(error = %e, "transient cache store error, retrying once");
            op().map_err(EngineError::from)
        }
        Err(e) => Err(e.into()),
    }
}

/// Open the store at `path`, returning its cache and session-log views.
pub fn open(path: impl AsRef<Path>) -> Result<(CacheStore, SessionLog)> {
    let db = Arc::new(Database::open(path.as_ref())?);
    let log = SessionLog::new(Arc::clone(&db))?;
    Ok((CacheStore::new(db), log))
}
