//! localsync Cache - Local record store
//!
//! SQLite-based implementation of the storage adapter port:
//! - Per-model record stores keyed by canonical primary key
//! - Secondary index entries for declared and relationship indexes
//! - Outbox (mutation event) and sync metadata tables
//! - A query planner choosing point lookups, index scans or full scans
//!
//! ## Architecture
//!
//! This crate implements `IStorageAdapter` from `localsync-core` on top of
//! SQLite, used purely as a key/index store. It is a driven (secondary)
//! adapter in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteStorageAdapter`] - Full `IStorageAdapter` implementation
//! - [`QueryPlan`] - Planner output, exposed for diagnostics
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use localsync_cache::{DatabasePool, SqliteStorageAdapter};
//! use localsync_core::domain::Schema;
//! use localsync_core::ports::IStorageAdapter;
//!
//! # async fn example(schema: Arc<Schema>) -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/var/lib/app/localsync.db")).await?;
//! let storage = SqliteStorageAdapter::new(schema, pool, 7);
//! storage.init().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod planner;
pub mod pool;
mod store;
mod transaction;

pub use adapter::SqliteStorageAdapter;
pub use planner::{IndexLookup, IndexStrategy, QueryPlan};
pub use pool::DatabasePool;

use localsync_core::ports::StorageError;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of stored values failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<CacheError> for StorageError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::SerializationError(msg) => StorageError::Serialization(msg),
            other => StorageError::QueryFailed(other.to_string()),
        }
    }
}
