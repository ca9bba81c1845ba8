//! localsync Sync - Outbox and synchronization engine
//!
//! Provides:
//! - A durable outbox of local mutations with per-record coalescing
//! - Merging of remote records under "pending local edits win" precedence
//! - A mutation processor with auth fallback, backoff and conflict handling
//! - A connectivity-driven sync orchestrator (base/delta sync, live feed)
//! - A cancellable task lifecycle manager shared by all long-running loops
//! - The [`DataStore`](datastore::DataStore) facade applications talk to
//!
//! ## Modules
//!
//! - [`lifecycle`] - Task registration, cancellation and joining
//! - [`outbox`] - FIFO mutation queue stored alongside the records
//! - [`merger`] - Applies inbound remote records to the local store
//! - [`processor`] - Sends outbox events to the remote service
//! - [`engine`] - Sync state machine tying the pieces together
//! - [`datastore`] - Application-facing facade

pub mod conflict;
pub mod control;
pub mod datastore;
pub mod engine;
pub mod lifecycle;
pub mod logging;
pub mod merger;
pub mod operations;
pub mod outbox;
pub mod processor;
pub mod retry;

pub use conflict::{
    ConflictData, ConflictHandler, ConflictResolution, DefaultConflictHandler, ErrorHandler,
    LoggingErrorHandler, MutationErrorReport,
};
pub use control::{ControlEvent, SyncState};
pub use datastore::{DataStore, DataStoreBuilder, InstanceAttachment, QuerySnapshot};
pub use engine::{SyncDependencies, SyncEngine};
pub use lifecycle::{LifecycleError, TaskManager};
pub use outbox::Outbox;

use thiserror::Error;

use localsync_core::domain::DomainError;
use localsync_core::ports::{RemoteError, StorageError};

/// Errors that can occur during synchronization and facade operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// A storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A domain-level error propagated from localsync-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Work was registered with a closed task manager
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// The store is shutting down or being cleared
    #[error("{0}")]
    InvalidState(String),

    /// The realtime subscription did not report a connection
    #[error("Subscription handshake failed: {0}")]
    Handshake(String),

    /// `load_related` was called on an instance this store did not return
    #[error("Instance of {model} is not attached to this store")]
    Detached { model: String },

    /// A remote call failed terminally
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The base/delta sync feed failed
    #[error("Sync feed error: {0}")]
    Feed(String),

    /// A stored mutation could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
