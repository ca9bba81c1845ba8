//! DataStore - the application-facing facade
//!
//! A [`DataStore`] bundles a schema, a storage adapter and (optionally) the
//! remote ports into one handle. Every operation lazily initializes storage
//! and starts the sync engine, and runs as a tracked job of the store's
//! [`TaskManager`], so `stop()` and `clear()` never race an operation that
//! is still touching storage.
//!
//! ## Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use localsync_core::domain::{ModelInstance, Schema};
//! # use localsync_core::ports::IStorageAdapter;
//! # use localsync_sync::{DataStore, SyncError};
//! # async fn demo(schema: Arc<Schema>, storage: Arc<dyn IStorageAdapter>) -> Result<(), SyncError> {
//! let store = DataStore::builder(schema, storage).build();
//! let post = ModelInstance::from_value("Post", serde_json::json!({"id": "1", "title": "Hi"}))?;
//! store.save(post, None).await?;
//! let found = store.query_by_id("Post", "1").await?;
//! assert!(found.is_some());
//! store.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use localsync_core::condition::{Predicate, PredicateBuilder};
use localsync_core::config::Config;
use localsync_core::domain::{ModelInstance, MutationEvent, Schema};
use localsync_core::ports::{
    ChangeOrigin, DeleteTarget, IStorageAdapter, Pagination, Related, StorageChange,
};

use crate::conflict::{
    ConflictHandler, DefaultConflictHandler, ErrorHandler, LoggingErrorHandler,
};
use crate::control::{ControlEvent, SyncState};
use crate::engine::{SyncDependencies, SyncEngine};
use crate::lifecycle::{LifecycleError, TaskManager};
use crate::outbox::Outbox;
use crate::SyncError;

/// Whether an instance came out of this store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceAttachment {
    /// Built by the application and never saved or returned by the store
    Detached,
    DataStore,
}

/// One emission of [`DataStore::observe_query`]
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub items: Vec<ModelInstance>,
    /// The model has completed at least one sync pass (always true without sync)
    pub is_synced: bool,
}

// ============================================================================
// T251: DataStoreBuilder
// ============================================================================

pub struct DataStoreBuilder {
    schema: Arc<Schema>,
    storage: Arc<dyn IStorageAdapter>,
    sync: Option<SyncDependencies>,
    config: Config,
    sync_expressions: HashMap<String, Predicate>,
    conflict_handler: Arc<dyn ConflictHandler>,
    error_handler: Arc<dyn ErrorHandler>,
}

impl DataStoreBuilder {
    pub fn new(schema: Arc<Schema>, storage: Arc<dyn IStorageAdapter>) -> Self {
        Self {
            schema,
            storage,
            sync: None,
            config: Config::default(),
            sync_expressions: HashMap::new(),
            conflict_handler: Arc::new(DefaultConflictHandler),
            error_handler: Arc::new(LoggingErrorHandler),
        }
    }

    /// Enables synchronization with the remote service
    pub fn sync(mut self, deps: SyncDependencies) -> Self {
        self.sync = Some(deps);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Restricts base/delta sync of the predicate's model to matching records
    pub fn sync_expression(mut self, predicate: Predicate) -> Self {
        self.sync_expressions
            .insert(predicate.model().to_string(), predicate);
        self
    }

    pub fn conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = handler;
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn build(self) -> DataStore {
        let engine = self.sync.map(|deps| {
            SyncEngine::new(
                self.schema.clone(),
                self.storage.clone(),
                deps,
                self.config,
                self.sync_expressions,
                self.conflict_handler,
                self.error_handler,
            )
        });

        DataStore {
            inner: Arc::new(StoreInner {
                schema: self.schema,
                storage: self.storage,
                engine,
                lifecycle: TaskManager::new("datastore"),
                started: Mutex::new(false),
                attachments: DashMap::new(),
            }),
        }
    }
}

// ============================================================================
// T252: DataStore
// ============================================================================

/// Local-first store handle; cheap to clone
#[derive(Clone)]
pub struct DataStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    schema: Arc<Schema>,
    storage: Arc<dyn IStorageAdapter>,
    engine: Option<SyncEngine>,
    lifecycle: TaskManager,
    started: Mutex<bool>,
    /// Keyed by (model, canonical primary key)
    attachments: DashMap<(String, String), InstanceAttachment>,
}

impl DataStore {
    pub fn builder(schema: Arc<Schema>, storage: Arc<dyn IStorageAdapter>) -> DataStoreBuilder {
        DataStoreBuilder::new(schema, storage)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Initializes storage and starts syncing, if configured
    pub async fn start(&self) -> Result<(), SyncError> {
        self.guarded("start", || async { Ok(()) }).await
    }

    async fn ensure_started(&self) -> Result<(), SyncError> {
        let mut started = self.inner.started.lock().await;
        if *started {
            return Ok(());
        }
        self.inner.storage.init().await?;
        if let Some(engine) = &self.inner.engine {
            engine.start().await?;
        }
        *started = true;
        info!(sync = self.inner.engine.is_some(), "DataStore started");
        Ok(())
    }

    /// Runs an operation as a tracked job, starting the store first
    async fn guarded<F, Fut, T>(&self, label: &str, op: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let result = self
            .inner
            .lifecycle
            .run(label, |_| async move {
                self.ensure_started().await?;
                op().await
            })
            .await;

        match result {
            Ok(result) => result,
            Err(LifecycleError::Closed(_)) => Err(SyncError::InvalidState(format!(
                "DataStore is stopping or clearing; await the pending stop() or clear() before calling {label}()"
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // T253: queries
    // ------------------------------------------------------------------------

    pub async fn query(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        pagination: Option<&Pagination>,
    ) -> Result<Vec<ModelInstance>, SyncError> {
        self.guarded("query", || async move {
            let items = self.inner.storage.query(model, predicate, pagination).await?;
            Ok(self.attach_all(items))
        })
        .await
    }

    /// Lookup by the single `id`-style primary key
    pub async fn query_by_id(
        &self,
        model: &str,
        id: &str,
    ) -> Result<Option<ModelInstance>, SyncError> {
        self.query_by_key(model, vec![Value::String(id.to_string())])
            .await
    }

    /// Lookup by the full (possibly composite) primary key
    pub async fn query_by_key(
        &self,
        model: &str,
        key: Vec<Value>,
    ) -> Result<Option<ModelInstance>, SyncError> {
        let predicate = PredicateBuilder::by_key(&self.inner.schema, model, key)?;
        let found = self.query(model, Some(&predicate), None).await?;
        Ok(found.into_iter().next())
    }

    // ------------------------------------------------------------------------
    // T254: writes
    // ------------------------------------------------------------------------

    /// Saves `instance` and the related records nested in it
    ///
    /// Returns the stored root record. With sync enabled the outbox event
    /// commits together with the record, and the call resolves once the
    /// engine has announced it.
    pub async fn save(
        &self,
        instance: ModelInstance,
        condition: Option<&Predicate>,
    ) -> Result<ModelInstance, SyncError> {
        self.guarded("save", || async move {
            let def = self.inner.schema.model(&instance.model)?.clone();
            let key = instance.key_string(&def)?;

            let tx = self.inner.storage.begin(ChangeOrigin::Local).await?;
            let saved = tx.save(instance, condition).await?;
            let changes = tx.commit().await?;
            self.await_enqueued(&changes).await;

            let mut root = None;
            for (item, _) in saved {
                let item = self.attach(item);
                let is_root = item.model == def.name
                    && item.key_string(&def).ok().as_deref() == Some(key.as_str());
                if is_root {
                    root = Some(item);
                }
            }
            root.ok_or_else(|| {
                SyncError::InvalidState(format!("{} {} was not stored", def.name, key))
            })
        })
        .await
    }

    /// Deletes with cascade; returns every removed record
    pub async fn delete(
        &self,
        target: DeleteTarget,
        condition: Option<&Predicate>,
    ) -> Result<Vec<ModelInstance>, SyncError> {
        self.guarded("delete", || async move {
            let tx = self.inner.storage.begin(ChangeOrigin::Local).await?;
            let deleted = tx.delete(target, condition).await?;
            let changes = tx.commit().await?;
            self.await_enqueued(&changes).await;
            Ok(deleted.into_iter().map(|(item, _)| item).collect())
        })
        .await
    }

    async fn await_enqueued(&self, changes: &[StorageChange]) {
        let last = changes.iter().map(|c| c.sequence).max();
        if let (Some(engine), Some(last)) = (&self.inner.engine, last) {
            engine.wait_for_enqueued(last).await;
        }
    }

    // ------------------------------------------------------------------------
    // T255: observation
    // ------------------------------------------------------------------------

    /// Committed changes, optionally for one model only
    ///
    /// The stream ends when the store is stopped or cleared.
    pub async fn observe(
        &self,
        model: Option<&str>,
    ) -> Result<mpsc::UnboundedReceiver<StorageChange>, SyncError> {
        let model = model.map(str::to_string);
        self.guarded("observe", || async move {
            if let Some(model) = &model {
                self.inner.schema.model(model)?;
            }
            let mut feed = self.inner.storage.subscribe();
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner.lifecycle.add("observe", move |token| async move {
                loop {
                    let change = tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tx.closed() => break,
                        change = feed.recv() => match change {
                            Some(change) => change,
                            None => break,
                        },
                    };
                    let wanted = model.as_ref().map_or(true, |m| *m == change.model);
                    if wanted && tx.send(change).is_err() {
                        break;
                    }
                }
            })?;
            Ok(rx)
        })
        .await
    }

    /// Snapshots of a query, re-emitted whenever `model` changes or finishes syncing
    pub async fn observe_query(
        &self,
        model: &str,
        predicate: Option<Predicate>,
        pagination: Option<Pagination>,
    ) -> Result<mpsc::UnboundedReceiver<QuerySnapshot>, SyncError> {
        let model = model.to_string();
        self.guarded("observe_query", || async move {
            self.inner.schema.model(&model)?;
            let mut feed = self.inner.storage.subscribe();
            let mut control = self.control_events();
            let (tx, rx) = mpsc::unbounded_channel();

            let store = self.clone();
            self.inner.lifecycle.add("observe_query", move |token| async move {
                let mut dirty = true;
                let mut control_closed = false;
                loop {
                    if control_closed {
                        control = None;
                    }
                    if dirty {
                        match store.snapshot(&model, predicate.as_ref(), pagination.as_ref()).await {
                            Ok(snapshot) => {
                                if tx.send(snapshot).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(model = %model, error = %e, "observe_query snapshot failed"),
                        }
                        dirty = false;
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tx.closed() => break,
                        change = feed.recv() => match change {
                            Some(change) => dirty = change.model == model,
                            None => break,
                        },
                        event = recv_control(&mut control) => match event {
                            Some(ControlEvent::ModelSynced { model: synced, .. }) => dirty = synced == model,
                            Some(_) => {}
                            None => control_closed = true,
                        },
                    }
                }
                debug!(model = %model, "observe_query stopped");
            })?;
            Ok(rx)
        })
        .await
    }

    async fn snapshot(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        pagination: Option<&Pagination>,
    ) -> Result<QuerySnapshot, SyncError> {
        let items = self.inner.storage.query(model, predicate, pagination).await?;
        let is_synced = self
            .inner
            .engine
            .as_ref()
            .map_or(true, |engine| engine.is_model_synced(model));
        Ok(QuerySnapshot {
            items: self.attach_all(items),
            is_synced,
        })
    }

    // ------------------------------------------------------------------------
    // T256: relations
    // ------------------------------------------------------------------------

    /// Loads a relation field of an instance this store returned
    pub async fn load_related(
        &self,
        instance: &ModelInstance,
        field: &str,
    ) -> Result<Related, SyncError> {
        if self.attachment(instance) != InstanceAttachment::DataStore {
            return Err(SyncError::Detached {
                model: instance.model.clone(),
            });
        }
        self.guarded("load_related", || async move {
            let related = match self.inner.storage.load_related(instance, field).await? {
                Related::One(item) => Related::One(item.map(|i| self.attach(i))),
                Related::Many(items) => Related::Many(self.attach_all(items)),
            };
            Ok(related)
        })
        .await
    }

    pub fn attachment(&self, instance: &ModelInstance) -> InstanceAttachment {
        self.attachment_key(instance)
            .and_then(|key| self.inner.attachments.get(&key).map(|a| *a))
            .unwrap_or(InstanceAttachment::Detached)
    }

    fn attachment_key(&self, instance: &ModelInstance) -> Option<(String, String)> {
        let def = self.inner.schema.model(&instance.model).ok()?;
        let key = instance.key_string(def).ok()?;
        Some((instance.model.clone(), key))
    }

    fn attach(&self, instance: ModelInstance) -> ModelInstance {
        if let Some(key) = self.attachment_key(&instance) {
            self.inner
                .attachments
                .insert(key, InstanceAttachment::DataStore);
        }
        instance
    }

    fn attach_all(&self, items: Vec<ModelInstance>) -> Vec<ModelInstance> {
        items.into_iter().map(|i| self.attach(i)).collect()
    }

    // ------------------------------------------------------------------------
    // T257: shutdown
    // ------------------------------------------------------------------------

    /// Waits for running operations, then stops syncing
    ///
    /// The next operation starts the store again.
    pub async fn stop(&self) {
        self.shutdown().await;
        self.inner.lifecycle.open();
        info!("DataStore stopped");
    }

    /// Stops and deletes every local record, outbox event and sync cursor
    pub async fn clear(&self) -> Result<(), SyncError> {
        self.shutdown().await;
        let cleared = self.inner.storage.clear().await;
        self.inner.attachments.clear();
        self.inner.lifecycle.open();
        cleared?;
        info!("DataStore cleared");
        Ok(())
    }

    async fn shutdown(&self) {
        self.inner.lifecycle.close().await;
        let mut started = self.inner.started.lock().await;
        if let Some(engine) = &self.inner.engine {
            engine.stop().await;
        }
        *started = false;
    }

    // ------------------------------------------------------------------------
    // T258: sync introspection
    // ------------------------------------------------------------------------

    /// Control stream of the sync engine; `None` without sync
    pub fn control_events(&self) -> Option<broadcast::Receiver<ControlEvent>> {
        self.inner.engine.as_ref().map(SyncEngine::control_events)
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        self.inner.engine.as_ref().map(SyncEngine::state)
    }

    pub fn outbox(&self) -> Option<&Arc<Outbox>> {
        self.inner.engine.as_ref().map(SyncEngine::outbox)
    }

    /// Queued outbox events, oldest first
    pub async fn pending_mutations(&self) -> Result<Vec<MutationEvent>, SyncError> {
        self.guarded("pending_mutations", || async move {
            let tx = self.inner.storage.begin(ChangeOrigin::Local).await?;
            let events = tx.all_mutations().await?;
            tx.rollback().await?;
            Ok(events)
        })
        .await
    }
}

/// Next control event; pends forever once there is no control stream
async fn recv_control(
    control: &mut Option<broadcast::Receiver<ControlEvent>>,
) -> Option<ControlEvent> {
    let Some(rx) = control.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Control stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
