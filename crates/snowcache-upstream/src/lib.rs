//! # snowcache-upstream
//!
//! Warehouse connectivity for the snowcache result cache engine.
//!
//! The engine never talks to a driver directly. It sees an [`UpstreamGateway`]
//! that leases pooled connections and exposes three operations: count a
//! statement, stream it in chunks, and run a health check.
//!
//! ## Features
//!
//! - **Driver abstraction**: [`Connection`]/[`RowCursor`]/[`ConnectionFactory`] traits,
//!   concrete drivers are chosen at startup
//! - **Connection pooling**: bounded, FIFO idle reuse, idle reaping, matched leases
//! - **Chunked cursors**: `fetchmany`-style batches of `chunk_rows`
//! - **Value model**: warehouse values with the string cell policy used by the cache
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use snowcache_upstream::prelude::*;
//!
//! let pool = ConnectionPool::new(PoolConfig::new("sqlite:///tmp/warehouse.db"),
//!     Arc::new(SqliteConnectionFactory::new()));
//! let gateway = UpstreamGateway::new(pool);
//!
//! let total = gateway.count("SELECT * FROM orders").await?;
//! let (columns, mut rows) = gateway.open_cursor("SELECT * FROM orders").await?;
//! while let Some(chunk) = rows.next_chunk().await? {
//!     // ...
//! }
//! rows.close().await;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - local SQLite upstream via rusqlite
//!
//! [`Connection`]: connection::Connection
//! [`RowCursor`]: connection::RowCursor
//! [`ConnectionFactory`]: connection::ConnectionFactory

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod security;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value model
    pub use crate::types::{ColumnMetadata, Row, Value};

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DriverKind, RowCursor,
    };

    // Pool types
    pub use crate::pool::{AtomicPoolStats, ConnectionPool, Lease, PoolConfig, PoolStats};

    // Gateway
    pub use crate::gateway::{ChunkStream, UpstreamGateway};

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteConnectionFactory;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use gateway::UpstreamGateway;
pub use types::Value;
