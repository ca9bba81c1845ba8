//! Storage adapter port (driven/secondary port)
//!
//! The storage adapter is a per-model indexed store with a single-writer
//! transaction primitive and a change feed.
//!
//! ## Design Notes
//!
//! - Every write, including outbox and metadata writes, goes through
//!   [`IStorageAdapter::begin`]. Only one transaction is open at a time, so
//!   read-modify-write sequences (outbox coalescing, merge precedence checks)
//!   are atomic.
//! - [`IStorageTransaction::commit`] publishes one [`StorageChange`] per
//!   affected record, in commit order, to every subscriber.
//! - A registered [`ICommitHook`] sees the staged record changes of every
//!   [`ChangeOrigin::Local`] transaction just before it commits, and may
//!   write through the same transaction. A hook error aborts the commit.
//! - Reads outside a transaction may run concurrently with each other.
//! - [`IRecordReader`] is the read surface shared by adapters and open
//!   transactions; the condition engine evaluates against it.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::condition::Predicate;
use crate::domain::{
    value, DomainError, ModelInstance, ModelMetadata, MutationEvent, OpType, RelationKind, Schema,
};

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// A conditional save/delete did not match the stored record
    #[error("Conditional check failed for {model} {id}")]
    ConditionalCheckFailed { model: String, id: String },

    /// The adapter was used before `init()` completed
    #[error("Storage is not initialized")]
    NotInitialized,

    /// Validation failure
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The backing store rejected a query
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored value could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction already closed")]
    TransactionClosed,
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// Change feed
// ============================================================================

/// Who produced a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Application writes; these are queued for the remote service
    Local,
    /// Records merged from the remote service
    Remote,
}

/// One committed record change
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    /// Monotonic commit sequence, starting at 1
    pub sequence: u64,
    pub model: String,
    pub element: ModelInstance,
    pub op: OpType,
    /// Filter JSON of the condition the write was made under
    pub condition: Option<Value>,
    pub origin: ChangeOrigin,
}

// ============================================================================
// Query helpers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

/// Page selection for `query`
///
/// Without a sort, results come back ordered by canonical primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: Option<usize>,
    pub page: usize,
    pub sort: Vec<SortField>,
}

impl Pagination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn offset(&self) -> usize {
        self.limit.map_or(0, |limit| limit * self.page)
    }

    /// Sorts (stable) and slices an already-filtered result set
    pub fn apply(&self, mut items: Vec<ModelInstance>) -> Vec<ModelInstance> {
        if !self.sort.is_empty() {
            items.sort_by(|a, b| {
                for sort in &self.sort {
                    let ord = value::compare_values(a.get(&sort.field), b.get(&sort.field));
                    let ord = match sort.direction {
                        SortDirection::Ascending => ord,
                        SortDirection::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        match self.limit {
            Some(limit) => items.into_iter().skip(self.offset()).take(limit).collect(),
            None => items,
        }
    }
}

/// Result of loading a relation field
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<ModelInstance>),
    Many(Vec<ModelInstance>),
}

impl Related {
    pub fn into_vec(self) -> Vec<ModelInstance> {
        match self {
            Related::One(item) => item.into_iter().collect(),
            Related::Many(items) => items,
        }
    }
}

/// What a delete removes
#[derive(Debug, Clone)]
pub enum DeleteTarget {
    /// The stored record with this instance's key
    Instance(ModelInstance),
    /// Every record of `model` matching `predicate` (all when `None`)
    Model {
        model: String,
        predicate: Option<Predicate>,
    },
}

// ============================================================================
// Port traits
// ============================================================================

/// Read surface shared by adapters and open transactions
#[async_trait::async_trait]
pub trait IRecordReader: Send + Sync {
    fn schema(&self) -> &Arc<Schema>;

    /// Ordered matches of an unscoped predicate
    async fn query(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        pagination: Option<&Pagination>,
    ) -> StorageResult<Vec<ModelInstance>>;

    /// Loads the records a relation field points at
    async fn load_related(&self, instance: &ModelInstance, field: &str) -> StorageResult<Related> {
        let schema = self.schema().clone();
        let def = schema.model(&instance.model)?;
        let rel = def
            .relationship(field)
            .ok_or_else(|| DomainError::UnknownField {
                model: def.name.clone(),
                field: field.to_string(),
            })?;
        let related_def = schema.model(&rel.related_model)?;

        match rel.kind {
            RelationKind::BelongsTo => {
                let mut pairs = Vec::with_capacity(rel.target_names.len());
                for (target, key) in rel.target_names.iter().zip(&related_def.primary_key) {
                    let v = instance.get(target);
                    if v.is_null() {
                        return Ok(Related::One(None));
                    }
                    pairs.push((key.clone(), v.clone()));
                }
                let predicate = Predicate::equalities(&related_def.name, pairs);
                let found = self
                    .query(&related_def.name, Some(&predicate), None)
                    .await?;
                Ok(Related::One(found.into_iter().next()))
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                let keys = instance.key_values(def)?;
                let pairs = rel.associated_with.iter().cloned().zip(keys).collect();
                let predicate = Predicate::equalities(&related_def.name, pairs);
                let found = self
                    .query(&related_def.name, Some(&predicate), None)
                    .await?;
                if rel.kind == RelationKind::HasOne {
                    Ok(Related::One(found.into_iter().next()))
                } else {
                    Ok(Related::Many(found))
                }
            }
        }
    }
}

/// An open single-writer transaction
///
/// Dropping a transaction without committing rolls it back.
#[async_trait::async_trait]
pub trait IStorageTransaction: IRecordReader {
    fn as_reader(&self) -> &dyn IRecordReader;

    async fn get(&self, model: &str, key: &[Value]) -> StorageResult<Option<ModelInstance>>;

    /// Saves a record and the related records nested in its relation fields
    async fn save(
        &self,
        instance: ModelInstance,
        condition: Option<&Predicate>,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>>;

    /// Deletes with relationship cascade
    async fn delete(
        &self,
        target: DeleteTarget,
        condition: Option<&Predicate>,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>>;

    /// Upserts, or deletes `_deleted` items, without cascade
    async fn batch_save(
        &self,
        model: &str,
        items: Vec<ModelInstance>,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>>;

    // --- outbox store ---

    async fn mutation_head(&self) -> StorageResult<Option<MutationEvent>>;

    async fn mutations_for(&self, model: &str, model_id: &str) -> StorageResult<Vec<MutationEvent>>;

    async fn mutation_model_ids(&self, model: &str) -> StorageResult<HashSet<String>>;

    async fn all_mutations(&self) -> StorageResult<Vec<MutationEvent>>;

    /// Inserts (sequence 0) or replaces (sequence kept) an event
    async fn put_mutation(&self, event: MutationEvent) -> StorageResult<MutationEvent>;

    async fn remove_mutation(&self, id: Uuid) -> StorageResult<()>;

    // --- sync metadata ---

    async fn get_metadata(&self, model: &str) -> StorageResult<Option<ModelMetadata>>;

    async fn put_metadata(&self, metadata: &ModelMetadata) -> StorageResult<()>;

    // --- completion ---

    /// Commits and returns the published changes
    async fn commit(&self) -> StorageResult<Vec<StorageChange>>;

    async fn rollback(&self) -> StorageResult<()>;
}

/// Runs inside a local transaction before it commits
#[async_trait::async_trait]
pub trait ICommitHook: Send + Sync {
    /// `changes` are the staged record changes, not yet numbered
    async fn before_commit(
        &self,
        tx: &dyn IStorageTransaction,
        changes: &[StorageChange],
    ) -> StorageResult<()>;
}

/// Port trait for the local store
#[async_trait::async_trait]
pub trait IStorageAdapter: IRecordReader {
    fn as_reader(&self) -> &dyn IRecordReader;

    /// Idempotent; concurrent callers wait for the same initialization
    async fn init(&self) -> StorageResult<()>;

    /// Opens the single-writer transaction, waiting for any open one
    async fn begin(&self, origin: ChangeOrigin) -> StorageResult<Box<dyn IStorageTransaction>>;

    /// New change-feed receiver; sees changes committed after this call
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChange>;

    /// Sequence of the last published change
    fn last_sequence(&self) -> u64;

    /// Replaces the pre-commit hook for local transactions
    fn set_commit_hook(&self, hook: Option<Arc<dyn ICommitHook>>);

    /// Drops all data and resets the initialized state
    async fn clear(&self) -> StorageResult<()>;

    async fn save(
        &self,
        instance: ModelInstance,
        condition: Option<&Predicate>,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>> {
        let tx = self.begin(ChangeOrigin::Local).await?;
        let saved = tx.save(instance, condition).await?;
        tx.commit().await?;
        Ok(saved)
    }

    async fn delete(
        &self,
        target: DeleteTarget,
        condition: Option<&Predicate>,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>> {
        let tx = self.begin(ChangeOrigin::Local).await?;
        let deleted = tx.delete(target, condition).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn batch_save(
        &self,
        model: &str,
        items: Vec<ModelInstance>,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>> {
        let tx = self.begin(ChangeOrigin::Local).await?;
        let saved = tx.batch_save(model, items).await?;
        tx.commit().await?;
        Ok(saved)
    }
}
