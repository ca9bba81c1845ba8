//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! engine. The sync crate depends on these interfaces; implementations live
//! in adapter crates (`localsync-cache`) or in the host application.
//!
//! ## Ports Overview
//!
//! - [`IStorageAdapter`] / [`IStorageTransaction`] - local key/index store with a change feed
//! - [`IRemoteApi`] / [`IAuthProvider`] - remote mutation/query execution and credentials
//! - [`IConnectivityMonitor`], [`ISubscriptionFeed`], [`ISyncFeed`] - inbound remote data

pub mod feeds;
pub mod remote;
pub mod storage;

pub use feeds::{
    ConnectionStatus, IConnectivityMonitor, ISubscriptionFeed, ISyncFeed, ModelSyncRequest,
    SubscriptionControl, SubscriptionStreams, SyncPage,
};
pub use remote::{
    AuthMode, GraphQlError, IAuthProvider, IRemoteApi, RemoteError, RemoteRequest,
    ERROR_TYPE_CONFLICT_UNHANDLED, ERROR_TYPE_UNAUTHORIZED,
};
pub use storage::{
    ChangeOrigin, DeleteTarget, ICommitHook, IRecordReader, IStorageAdapter, IStorageTransaction,
    Pagination, Related, SortDirection, SortField, StorageChange, StorageError, StorageResult,
};
