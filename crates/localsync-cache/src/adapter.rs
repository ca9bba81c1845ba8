//! SQLite implementation of IStorageAdapter
//!
//! ## Concurrency
//!
//! - Reads outside a transaction use pooled connections and may run
//!   concurrently.
//! - [`SqliteStorageAdapter::begin`] takes the writer lock before opening
//!   the SQLite transaction; the lock is held until commit, rollback or
//!   drop of the returned transaction, so only one writer exists at a time.
//! - Committed changes are numbered from a process-wide counter and pushed
//!   to every live subscriber in commit order.
//! - The commit hook runs while the writer lock is still held, so whatever
//!   it writes lands in the same SQLite transaction as the staged records.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use localsync_core::condition::Predicate;
use localsync_core::config::StorageConfig;
use localsync_core::domain::{ModelInstance, Schema};
use localsync_core::ports::{
    ChangeOrigin, ICommitHook, IRecordReader, IStorageAdapter, IStorageTransaction, Pagination,
    StorageChange, StorageError, StorageResult,
};

use crate::planner::{self, QueryPlan};
use crate::pool::DatabasePool;
use crate::transaction::SqliteTransaction;
use crate::CacheError;

/// State shared by the adapter and its open transactions
pub(crate) struct Shared {
    pub(crate) schema: Arc<Schema>,
    pub(crate) db: DatabasePool,
    pub(crate) writer: Arc<Mutex<()>>,
    init_lock: Mutex<()>,
    ready: AtomicBool,
    sequence: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<StorageChange>>,
    next_subscriber: AtomicU64,
    commit_hook: RwLock<Option<Arc<dyn ICommitHook>>>,
    pub(crate) union_breakpoint: usize,
}

impl Shared {
    pub(crate) fn ensure_ready(&self) -> StorageResult<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::NotInitialized)
        }
    }

    pub(crate) fn commit_hook(&self) -> Option<Arc<dyn ICommitHook>> {
        match self.commit_hook.read() {
            Ok(hook) => hook.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Numbers and broadcasts committed changes
    pub(crate) fn publish(&self, changes: Vec<StorageChange>) -> Vec<StorageChange> {
        let mut published = Vec::with_capacity(changes.len());
        for mut change in changes {
            change.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            self.subscribers
                .retain(|_, tx| tx.send(change.clone()).is_ok());
            published.push(change);
        }
        published
    }
}

/// SQLite-backed local store
///
/// Cloning is cheap; clones share the pool, writer lock and change feed.
#[derive(Clone)]
pub struct SqliteStorageAdapter {
    shared: Arc<Shared>,
}

impl SqliteStorageAdapter {
    /// Creates an adapter over an open pool
    ///
    /// `union_breakpoint` is the largest `or` the planner serves with
    /// index lookups before falling back to a full scan.
    pub fn new(schema: Arc<Schema>, db: DatabasePool, union_breakpoint: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                schema,
                db,
                writer: Arc::new(Mutex::new(())),
                init_lock: Mutex::new(()),
                ready: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                subscribers: DashMap::new(),
                next_subscriber: AtomicU64::new(0),
                commit_hook: RwLock::new(None),
                union_breakpoint,
            }),
        }
    }

    /// Opens the database file named in the configuration
    pub async fn from_config(schema: Arc<Schema>, config: &StorageConfig) -> Result<Self, CacheError> {
        let db = DatabasePool::new(&config.path).await?;
        Ok(Self::new(schema, db, config.union_breakpoint))
    }

    /// Access path the planner picks for an unscoped predicate
    pub fn explain(&self, model: &str, predicate: Option<&Predicate>) -> StorageResult<QueryPlan> {
        let def = self.shared.schema.model(model)?;
        Ok(planner::plan_query(def, predicate, self.shared.union_breakpoint))
    }

    /// Number of live change-feed subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }
}

#[async_trait::async_trait]
impl IRecordReader for SqliteStorageAdapter {
    fn schema(&self) -> &Arc<Schema> {
        &self.shared.schema
    }

    async fn query(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        pagination: Option<&Pagination>,
    ) -> StorageResult<Vec<ModelInstance>> {
        self.shared.ensure_ready()?;
        let def = self.shared.schema.model(model)?.clone();

        if let Some(p) = predicate.filter(|p| p.has_relation_scope()) {
            let items = p.optimized().fetch(self).await?;
            return Ok(match pagination {
                Some(page) => page.apply(items),
                None => items,
            });
        }

        let mut conn = self
            .shared
            .db
            .pool()
            .acquire()
            .await
            .map_err(CacheError::from)?;
        planner::run_query(
            &mut conn,
            &def,
            predicate,
            pagination,
            self.shared.union_breakpoint,
        )
        .await
    }
}

#[async_trait::async_trait]
impl IStorageAdapter for SqliteStorageAdapter {
    fn as_reader(&self) -> &dyn IRecordReader {
        self
    }

    async fn init(&self) -> StorageResult<()> {
        if self.shared.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.shared.init_lock.lock().await;
        if self.shared.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.shared.db.run_migrations().await?;
        self.shared.ready.store(true, Ordering::Release);
        tracing::info!(
            namespace = %self.shared.schema.namespace,
            models = self.shared.schema.models.len(),
            "Storage initialized"
        );
        Ok(())
    }

    async fn begin(&self, origin: ChangeOrigin) -> StorageResult<Box<dyn IStorageTransaction>> {
        self.shared.ensure_ready()?;
        let guard = self.shared.writer.clone().lock_owned().await;
        let tx = self
            .shared
            .db
            .pool()
            .begin()
            .await
            .map_err(CacheError::from)?;
        tracing::trace!(?origin, "Transaction opened");
        Ok(Box::new(SqliteTransaction::new(
            self.shared.clone(),
            origin,
            tx,
            guard,
        )))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StorageChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.insert(id, tx);
        rx
    }

    fn last_sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    fn set_commit_hook(&self, hook: Option<Arc<dyn ICommitHook>>) {
        let mut slot = match self.shared.commit_hook.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = hook;
    }

    async fn clear(&self) -> StorageResult<()> {
        let _writer = self.shared.writer.lock().await;
        let _init = self.shared.init_lock.lock().await;
        self.shared.ready.store(false, Ordering::Release);
        self.shared.db.drop_all().await?;
        tracing::info!(namespace = %self.shared.schema.namespace, "Storage cleared");
        Ok(())
    }
}
