//! Engine configuration
//!
//! Every limit the engine enforces lives here. Defaults match production;
//! each field can be overridden from a `SNOWCACHE_<NAME>` environment variable
//! (durations in whole seconds).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Prefix of every configuration environment variable
pub const ENV_PREFIX: &str = "SNOWCACHE_";

/// Process-wide engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedded store file (registry and cache tables)
    pub db_path: PathBuf,
    /// Rows per upstream fetch
    pub chunk_rows: usize,
    /// Upstream pool size
    pub max_pool: usize,
    /// Sessions allowed in Pending or Active at once
    pub max_concurrent: usize,
    /// Largest result that may be displayed without confirmation
    pub max_for_display: u64,
    /// Largest result that may be cached at all, and the CSV/TSV export cap
    pub max_for_csv: u64,
    /// Clipboard export cap
    pub max_for_clipboard: u64,
    /// XLSX export cap
    pub max_for_excel: u64,
    /// Largest XLSX export that may embed a chart
    pub max_for_excel_chart: u64,
    /// A running session without progress for this long is timed out
    pub active_timeout: Duration,
    /// Sessions older than this are removed regardless of status
    pub max_session_age: Duration,
    /// Progress flush interval for the durable session log
    pub sync_interval: Duration,
    /// Janitor period
    pub janitor_sweep: Duration,
    /// Upper bound for unique-value requests
    pub max_unique_limit: usize,
    /// Upper bound for interactive page sizes
    pub max_page_size: usize,
    /// Concurrent upstream round trips
    pub upstream_workers: usize,
    /// Per-call upstream RPC timeout
    pub rpc_timeout: Duration,
    /// Retention of Completed sessions
    pub retention_completed: Duration,
    /// Retention of Failed sessions
    pub retention_failed: Duration,
    /// Retention of TimedOut sessions
    pub retention_timed_out: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./snowcache.db"),
            chunk_rows: 2000,
            max_pool: 10,
            max_concurrent: 5,
            max_for_display: 1_000_000,
            max_for_csv: 10_000_000,
            max_for_clipboard: 50_000,
            max_for_excel: 1_048_575,
            max_for_excel_chart: 100_000,
            active_timeout: Duration::from_secs(30 * 60),
            max_session_age: Duration::from_secs(12 * 60 * 60),
            sync_interval: Duration::from_secs(10),
            janitor_sweep: Duration::from_secs(5 * 60),
            max_unique_limit: 10_000,
            max_page_size: 1000,
            upstream_workers: 4,
            rpc_timeout: Duration::from_secs(30),
            retention_completed: Duration::from_secs(60 * 60),
            retention_failed: Duration::from_secs(120 * 60),
            retention_timed_out: Duration::from_secs(60 * 60),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the process environment
    pub fn from_env() -> Result<Self> {
        Self::default().apply_overrides(|name| std::env::var(name).ok())
    }

    /// Override fields from `lookup`, which maps a full variable name
    /// (e.g. `SNOWCACHE_CHUNK_ROWS`) to its value.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_num(&get, "CHUNK_ROWS", &mut self.chunk_rows)?;
        override_num(&get, "MAX_POOL", &mut self.max_pool)?;
        override_num(&get, "MAX_CONCURRENT", &mut self.max_concurrent)?;
        override_num(&get, "MAX_FOR_DISPLAY", &mut self.max_for_display)?;
        override_num(&get, "MAX_FOR_CSV", &mut self.max_for_csv)?;
        override_num(&get, "MAX_FOR_CLIPBOARD", &mut self.max_for_clipboard)?;
        override_num(&get, "MAX_FOR_EXCEL", &mut self.max_for_excel)?;
        override_num(&get, "MAX_FOR_EXCEL_CHART", &mut self.max_for_excel_chart)?;
        override_secs(&get, "ACTIVE_TIMEOUT", &mut self.active_timeout)?;
        override_secs(&get, "MAX_SESSION_AGE", &mut self.max_session_age)?;
        override_secs(&get, "SYNC_INTERVAL_S", &mut self.sync_interval)?;
        override_secs(&get, "JANITOR_SWEEP", &mut self.janitor_sweep)?;
        override_num(&get, "MAX_UNIQUE_LIMIT", &mut self.max_unique_limit)?;
        override_num(&get, "MAX_PAGE_SIZE", &mut self.max_page_size)?;
        override_num(&get, "UPSTREAM_WORKERS", &mut self.upstream_workers)?;
        override_secs(&get, "RPC_TIMEOUT", &mut self.rpc_timeout)?;
        override_secs(&get, "RETENTION_COMPLETED", &mut self.retention_completed)?;
        override_secs(&get, "RETENTION_FAILED", &mut self.retention_failed)?;
        override_secs(&get, "RETENTION_TIMED_OUT", &mut self.retention_timed_out)?;

        self.validate()?;
        Ok(self)
    }

    /// Set the store file
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Set rows per upstream fetch
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows;
        self
    }

    /// Set the upstream pool size
    pub fn with_max_pool(mut self, size: usize) -> Self {
        self.max_pool = size;
        self
    }

    /// Set the concurrency cap
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Set the display gate
    pub fn with_max_for_display(mut self, rows: u64) -> Self {
        self.max_for_display = rows;
        self
    }

    /// Set the hard size gate and CSV cap
    pub fn with_max_for_csv(mut self, rows: u64) -> Self {
        self.max_for_csv = rows;
        self
    }

    /// Set the clipboard cap
    pub fn with_max_for_clipboard(mut self, rows: u64) -> Self {
        self.max_for_clipboard = rows;
        self
    }

    /// Set the XLSX cap
    pub fn with_max_for_excel(mut self, rows: u64) -> Self {
        self.max_for_excel = rows;
        self
    }

    /// Set the XLSX chart cap
    pub fn with_max_for_excel_chart(mut self, rows: u64) -> Self {
        self.max_for_excel_chart = rows;
        self
    }

    /// Set the active timeout
    pub fn with_active_timeout(mut self, timeout: Duration) -> Self {
        self.active_timeout = timeout;
        self
    }

    /// Set the maximum session age
    pub fn with_max_session_age(mut self, age: Duration) -> Self {
        self.max_session_age = age;
        self
    }

    /// Set the progress flush interval
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the janitor period
    pub fn with_janitor_sweep(mut self, interval: Duration) -> Self {
        self.janitor_sweep = interval;
        self
    }

    /// Set the interactive page size bound
    pub fn with_max_page_size(mut self, size: usize) -> Self {
        self.max_page_size = size;
        self
    }

    /// Set the unique-values bound
    pub fn with_max_unique_limit(mut self, limit: usize) -> Self {
        self.max_unique_limit = limit;
        self
    }

    /// Set concurrent upstream round trips
    pub fn with_upstream_workers(mut self, workers: usize) -> Self {
        self.upstream_workers = workers;
        self
    }

    /// Set the upstream RPC timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("chunk_rows", self.chunk_rows),
            ("max_pool", self.max_pool),
            ("max_concurrent", self.max_concurrent),
            ("max_page_size", self.max_page_size),
            ("max_unique_limit", self.max_unique_limit),
            ("upstream_workers", self.upstream_workers),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(EngineError::Config(format!("{} must be greater than 0", name)));
        }
        if self.max_for_display > self.max_for_csv {
            return Err(EngineError::Config(format!(
                "max_for_display ({}) cannot exceed max_for_csv ({})",
                self.max_for_display, self.max_for_csv
            )));
        }
        if self.max_for_excel_chart > self.max_for_excel {
            return Err(EngineError::Config(format!(
                "max_for_excel_chart ({}) cannot exceed max_for_excel ({})",
                self.max_for_excel_chart, self.max_for_excel
            )));
        }
        if self.janitor_sweep.is_zero() {
            return Err(EngineError::Config("janitor_sweep must be non-zero".into()));
        }
        Ok(())
    }
}

fn override_num<T, G>(get: &G, name: &str, field: &mut T) -> Result<()>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *field = raw.trim().parse().map_err(|_| {
            EngineError::Config(format!("{}{}: invalid number '{}'", ENV_PREFIX, name, raw))
        })?;
    }
    Ok(())
}

fn override_secs<G>(get: &G, name: &str, field: &mut Duration) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
{
    let mut secs = field.as_secs();
    override_num(get, name, &mut secs)?;
    *field = Duration::from_secs(secs);
    Ok(())
}
