//! # snowcache-engine
//!
//! Query execution and result cache engine for a SQL workbench.
//!
//! A `SELECT` statement is counted upstream, gated by size, then streamed in
//! chunks into a per-session table of an embedded SQLite file. Later reads
//! (pages, filters, sorts, distinct values, exports) are answered from that
//! table without touching the warehouse again.
//!
//! ## Components
//!
//! - [`store::CacheStore`]: per-session cache tables and filtered reads
//! - [`registry::SessionRegistry`]: session state machine, concurrency cap,
//!   durable log and restart recovery
//! - [`progress::ProgressTracker`]: streaming progress and cancel signals
//! - [`coordinator::ExecutionCoordinator`]: admission, gates and streaming
//! - [`export`]: CSV, TSV and XLSX encoders
//! - [`janitor::Janitor`]: timeouts, retention and orphan tables
//! - [`Engine`]: owns all of the above
//!
//! Every cached cell is a string: NULL becomes `""`, numbers, booleans and
//! timestamps their canonical text. Sorting is therefore lexicographic.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use snowcache_engine::prelude::*;
//! use snowcache_upstream::prelude::*;
//!
//! let engine = Engine::open(
//!     EngineConfig::from_env()?,
//!     Arc::new(SqliteConnectionFactory::new()),
//!     ConnectionConfig::new("sqlite:///data/warehouse.db"),
//! )?;
//!
//! let outcome = engine.execute("SELECT * FROM orders", "alice", None).await?;
//! if let Some(id) = outcome.session_id() {
//!     let page = engine.read(id, &PageQuery::new(1, 100))?;
//!     println!("{} of {} rows", page.rows.len(), page.total);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod export;
pub mod janitor;
pub mod progress;
pub mod registry;
pub mod session;
pub mod store;
pub mod validator;

/// Prelude module for convenient imports
pub mod prelude {
    // Errors
    pub use crate::error::{EngineError, ErrorBody, ErrorCode, Result};

    // Configuration
    pub use crate::config::EngineConfig;

    // Engine and operations
    pub use crate::coordinator::{ExecuteOptions, ExecuteOutcome, ExportOutput, StatusReport};
    pub use crate::engine::{Engine, EngineStats};
    pub use crate::janitor::SweepReport;

    // Sessions
    pub use crate::session::{Session, SessionStatus};

    // Reads
    pub use crate::store::{
        ExtendedFilter, FilterOp, Page, PageQuery, ScanQuery, SortOrder, UniqueValues,
    };

    // Export
    pub use crate::export::{ChartSpec, ChartType, ExportFormat, ExportRequest, ExportSummary};

    // Validation
    pub use crate::validator::{SelectOnlyValidator, StatementValidator};
}

// Re-export commonly used items at crate root
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
