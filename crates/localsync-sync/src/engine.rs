//! Sync engine - connectivity-driven orchestration of the outbox and inbound data
//!
//! The engine owns every long-running loop of a started store:
//!
//! ```text
//! local commit ──→ Outbox ──→ MutationProcessor ──→ remote
//!                                         │
//!                        processed records ──→ ModelMerger ──→ storage
//!
//! connectivity ──→ subscriptions handshake ──→ base/delta sync ──→ live feed
//! ```
//!
//! ## States
//!
//! `Idle → SettingUpModels → {Offline ⇄ ConnectingRealtime → BaseOrDeltaSync
//! → SteadyState} → Stopped`. Going offline cancels the online loop, pauses
//! outbox draining and tears the subscriptions down; local writes keep
//! being queued.
//!
//! Local record changes are enqueued by a commit hook the engine registers
//! on the storage adapter, inside the transaction that wrote them. The
//! change-feed loop only announces them and wakes the processor.
//!
//! All loops are registered with the engine's [`TaskManager`], so
//! [`SyncEngine::stop`] resolves only once none of them is running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use localsync_core::condition::Predicate;
use localsync_core::config::Config;
use localsync_core::domain::{
    ModelDefinition, ModelInstance, ModelMetadata, MutationEvent, OpType, Schema,
};
use localsync_core::ports::{
    ChangeOrigin, IAuthProvider, ICommitHook, IConnectivityMonitor, IRemoteApi, IStorageAdapter,
    IStorageTransaction, ISubscriptionFeed, ISyncFeed, ModelSyncRequest, StorageChange,
    StorageResult, SubscriptionControl, SubscriptionStreams, SyncPage,
};

use crate::conflict::{ConflictHandler, ErrorHandler};
use crate::control::{ControlEvent, SyncState};
use crate::lifecycle::TaskManager;
use crate::merger::ModelMerger;
use crate::outbox::Outbox;
use crate::processor::{MutationProcessor, ProcessorEvent};
use crate::SyncError;

const CONTROL_CHANNEL_CAPACITY: usize = 256;

/// Remote-facing ports a syncing store needs
#[derive(Clone)]
pub struct SyncDependencies {
    pub remote: Arc<dyn IRemoteApi>,
    pub auth: Option<Arc<dyn IAuthProvider>>,
    pub connectivity: Arc<dyn IConnectivityMonitor>,
    pub subscriptions: Arc<dyn ISubscriptionFeed>,
    pub sync_feed: Arc<dyn ISyncFeed>,
}

/// Per-model counters of one sync pass
#[derive(Debug, Default, Clone, Copy)]
struct MergeCounts {
    created: usize,
    updated: usize,
    deleted: usize,
}

impl MergeCounts {
    fn tally(&mut self, op: OpType) {
        match op {
            OpType::Insert => self.created += 1,
            OpType::Update => self.updated += 1,
            OpType::Delete => self.deleted += 1,
        }
    }
}

type OnlineTask = (CancellationToken, JoinHandle<()>);

/// Enqueues local record changes of syncable models in the writing transaction
struct OutboxCommitHook {
    schema: Arc<Schema>,
    outbox: Arc<Outbox>,
}

#[async_trait::async_trait]
impl ICommitHook for OutboxCommitHook {
    async fn before_commit(
        &self,
        tx: &dyn IStorageTransaction,
        changes: &[StorageChange],
    ) -> StorageResult<()> {
        for change in changes {
            let Ok(def) = self.schema.model(&change.model) else {
                continue;
            };
            if !def.syncable {
                continue;
            }
            let event = MutationEvent::new(
                change.element.model_id(def)?,
                change.op.into(),
                &change.element,
                change.condition.as_ref(),
            );
            self.outbox.enqueue(tx, event).await?;
        }
        Ok(())
    }
}

// ============================================================================
// T241: SyncEngine
// ============================================================================

/// Orchestrates outbox draining and inbound sync for one store
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    schema: Arc<Schema>,
    storage: Arc<dyn IStorageAdapter>,
    deps: SyncDependencies,
    config: Config,
    sync_expressions: HashMap<String, Predicate>,
    outbox: Arc<Outbox>,
    merger: ModelMerger,
    processor: Arc<MutationProcessor>,
    lifecycle: TaskManager,
    control: broadcast::Sender<ControlEvent>,
    state: watch::Sender<SyncState>,
    /// Last storage sequence the change-feed loop has announced
    enqueued: watch::Sender<u64>,
    synced_models: DashSet<String>,
}

impl SyncEngine {
    pub fn new(
        schema: Arc<Schema>,
        storage: Arc<dyn IStorageAdapter>,
        deps: SyncDependencies,
        config: Config,
        sync_expressions: HashMap<String, Predicate>,
        conflict_handler: Arc<dyn ConflictHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        let outbox = Arc::new(Outbox::new());
        let processor = Arc::new(MutationProcessor::new(
            schema.clone(),
            storage.clone(),
            outbox.clone(),
            deps.remote.clone(),
            deps.auth.clone(),
            conflict_handler,
            error_handler,
            config.mutations.clone(),
        ));
        let (control, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(SyncState::Idle);
        let (enqueued, _) = watch::channel(0);
        storage.set_commit_hook(Some(Arc::new(OutboxCommitHook {
            schema: schema.clone(),
            outbox: outbox.clone(),
        })));

        Self {
            inner: Arc::new(Inner {
                schema,
                storage,
                deps,
                config,
                sync_expressions,
                merger: ModelMerger::new(outbox.clone()),
                outbox,
                processor,
                lifecycle: TaskManager::new("sync-engine"),
                control,
                state,
                enqueued,
                synced_models: DashSet::new(),
            }),
        }
    }

    pub fn control_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.inner.control.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.inner.outbox
    }

    /// True once a sync pass completed for `model` since the last start
    pub fn is_model_synced(&self, model: &str) -> bool {
        self.inner.synced_models.contains(model)
    }

    // ========================================================================
    // T242: start / stop
    // ========================================================================

    /// Starts every loop and waits for the first connectivity transition
    ///
    /// # Errors
    ///
    /// Fails when model setup fails or when the first realtime handshake
    /// after coming online fails. The engine is stopped again in that case.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        inner.lifecycle.open();
        inner.synced_models.clear();
        inner.set_state(SyncState::SettingUpModels);
        inner.setup_models().await?;

        let feed = inner.storage.subscribe();
        inner.enqueued.send_replace(inner.storage.last_sequence());
        inner.emit(ControlEvent::StorageSubscribed);

        let this = inner.clone();
        inner
            .lifecycle
            .add("storage-feed", move |token| this.storage_feed(feed, token))?;

        let (processed_tx, processed_rx) = mpsc::unbounded_channel();
        let processor = inner.processor.clone();
        inner
            .lifecycle
            .add("mutation-processor", move |token| processor.run(token, processed_tx))?;

        let this = inner.clone();
        inner.lifecycle.add("processed-merge", move |token| {
            this.processed_merge(processed_rx, token)
        })?;

        let (first_tx, first_rx) = oneshot::channel();
        let this = inner.clone();
        inner
            .lifecycle
            .add("connectivity", move |token| this.connectivity(token, first_tx))?;

        let first = match first_rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::InvalidState(
                "sync engine stopped while starting".into(),
            )),
        };
        if let Err(e) = first {
            warn!(error = %e, "Sync engine failed to start");
            self.stop().await;
            return Err(e);
        }
        info!("Sync engine started");
        Ok(())
    }

    /// Stops every loop; resolves once none is running
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.processor.pause();
        inner.lifecycle.close().await;
        inner.deps.subscriptions.stop().await;
        inner.lifecycle.open();
        // Release anyone waiting for a change that will never be handled
        inner.enqueued.send_replace(u64::MAX);
        inner.set_state(SyncState::Stopped);
        info!("Sync engine stopped");
    }

    /// Waits until the change-feed loop has handled commit `sequence`
    pub async fn wait_for_enqueued(&self, sequence: u64) {
        let mut rx = self.inner.enqueued.subscribe();
        let _ = rx.wait_for(|handled| *handled >= sequence).await;
    }
}

impl Inner {
    fn emit(&self, event: ControlEvent) {
        // No receivers is fine
        let _ = self.control.send(event);
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Sync state changed");
        }
    }

    fn is_syncable(&self, model: &str) -> bool {
        self.schema.model(model).map(|d| d.syncable).unwrap_or(false)
    }

    fn report(&self, source: &str, error: &SyncError) {
        error!(source, error = %error, "Sync loop error");
        self.emit(ControlEvent::Error {
            source: source.to_string(),
            message: error.to_string(),
        });
    }

    // ========================================================================
    // T243: model setup
    // ========================================================================

    /// Ensures one metadata row per syncable model
    ///
    /// A changed sync expression invalidates the model's sync cursor so the
    /// next pass is a full sync under the new filter.
    async fn setup_models(&self) -> Result<(), SyncError> {
        let interval_ms = self.config.sync.full_sync_interval().as_millis() as i64;
        let tx = self.storage.begin(ChangeOrigin::Remote).await?;
        for def in self.schema.syncable_models() {
            let hash = self.sync_expressions.get(&def.name).map(Predicate::filter_hash);
            let mut meta = tx.get_metadata(&def.name).await?.unwrap_or_else(|| {
                ModelMetadata::new(self.schema.namespace.clone(), def.name.clone(), interval_ms)
            });
            if meta.last_sync_predicate_hash != hash {
                info!(model = %def.name, "Sync expression changed, resetting sync cursor");
                meta.last_sync = None;
                meta.last_full_sync = None;
                meta.last_sync_predicate_hash = hash;
            }
            meta.full_sync_interval = interval_ms;
            tx.put_metadata(&meta).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // T244: announcing enqueued local changes
    // ========================================================================

    /// Reports local changes the commit hook queued and wakes the processor

    async fn storage_feed(
        self: Arc<Self>,
        mut feed: mpsc::UnboundedReceiver<StorageChange>,
        token: CancellationToken,
    ) {
        loop {
            let change = tokio::select! {
                _ = token.cancelled() => break,
                change = feed.recv() => match change {
                    Some(change) => change,
                    None => break,
                },
            };

            if change.origin == ChangeOrigin::Local && self.is_syncable(&change.model) {
                self.emit(ControlEvent::OutboxMutationEnqueued {
                    model: change.model.clone(),
                    element: change.element.clone(),
                });
                self.processor.notify();
            }
            self.enqueued.send_if_modified(|handled| {
                let advanced = change.sequence > *handled;
                if advanced {
                    *handled = change.sequence;
                }
                advanced
            });
        }
        debug!("Storage feed loop stopped");
    }

    // ========================================================================
    // T245: processed mutations back into storage
    // ========================================================================

    async fn processed_merge(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ProcessorEvent>,
        token: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let has_more = match event {
                ProcessorEvent::Processed(processed) => {
                    if let Err(e) = self.merge_one(processed.record.clone()).await {
                        self.report("processed-merge", &e);
                    }
                    self.emit(ControlEvent::OutboxMutationProcessed {
                        model: processed.model,
                        element: processed.record,
                    });
                    processed.has_more
                }
                ProcessorEvent::Discarded { has_more, .. } => has_more,
            };
            self.emit(ControlEvent::OutboxStatus {
                is_empty: !has_more,
            });
        }
    }

    /// Merges one remote record in its own transaction
    async fn merge_one(&self, record: ModelInstance) -> Result<Option<OpType>, SyncError> {
        let def = self.schema.model(&record.model)?.clone();
        let tx = self.storage.begin(ChangeOrigin::Remote).await?;
        let op = self.merger.merge(tx.as_ref(), record, &def).await?;
        tx.commit().await?;
        Ok(op)
    }

    // ========================================================================
    // T246: connectivity
    // ========================================================================

    async fn connectivity(
        self: Arc<Self>,
        token: CancellationToken,
        first: oneshot::Sender<Result<(), SyncError>>,
    ) {
        let mut first = Some(first);
        let mut statuses = self.deps.connectivity.status();
        let mut online: Option<OnlineTask> = None;

        loop {
            let status = tokio::select! {
                _ = token.cancelled() => break,
                status = statuses.next() => match status {
                    Some(status) => status,
                    None => break,
                },
            };
            info!(online = status.online, "Network status changed");
            self.emit(ControlEvent::NetworkStatus {
                active: status.online,
            });

            if !status.online {
                self.go_offline(&mut online).await;
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }
                continue;
            }
            if online.is_some() {
                continue;
            }

            self.set_state(SyncState::ConnectingRealtime);
            let handshake = tokio::select! {
                _ = token.cancelled() => break,
                result = self.handshake() => result,
            };
            match handshake {
                Ok(streams) => {
                    let child = token.child_token();
                    let this = self.clone();
                    let loop_token = child.clone();
                    match self
                        .lifecycle
                        .add("online", move |_| this.online(loop_token, streams))
                    {
                        Ok(handle) => online = Some((child, handle)),
                        Err(e) => {
                            debug!(error = %e, "Engine closing, not going online");
                            break;
                        }
                    }
                    if let Some(first) = first.take() {
                        let _ = first.send(Ok(()));
                    }
                }
                Err(e) => {
                    self.report("subscriptions", &e);
                    self.deps.subscriptions.stop().await;
                    self.processor.pause();
                    self.set_state(SyncState::Offline);
                    if let Some(first) = first.take() {
                        let _ = first.send(Err(e));
                    }
                }
            }
        }

        if online.is_some() {
            self.go_offline(&mut online).await;
        }
        if let Some(first) = first.take() {
            let _ = first.send(Ok(()));
        }
        debug!("Connectivity loop stopped");
    }

    async fn handshake(&self) -> Result<SubscriptionStreams, SyncError> {
        let mut streams = self
            .deps
            .subscriptions
            .start()
            .await
            .map_err(|e| SyncError::Handshake(format!("{e:#}")))?;

        match streams.control.next().await {
            Some(SubscriptionControl::Connected) => {
                self.emit(ControlEvent::SubscriptionsEstablished);
                Ok(streams)
            }
            Some(SubscriptionControl::Error(message)) => Err(SyncError::Handshake(message)),
            None => Err(SyncError::Handshake(
                "subscription control stream ended before connecting".into(),
            )),
        }
    }

    async fn go_offline(&self, online: &mut Option<OnlineTask>) {
        if let Some((token, handle)) = online.take() {
            token.cancel();
            let _ = handle.await;
        }
        self.processor.pause();
        self.deps.subscriptions.stop().await;
        self.set_state(SyncState::Offline);
    }

    // ========================================================================
    // T247: online loop
    // ========================================================================

    async fn online(self: Arc<Self>, token: CancellationToken, streams: SubscriptionStreams) {
        let SubscriptionStreams {
            mut control,
            mut data,
        } = streams;

        self.set_state(SyncState::BaseOrDeltaSync);
        if let Err(e) = self.sync_pass(&token).await {
            self.report("sync", &e);
        }
        if token.is_cancelled() {
            return;
        }

        self.processor.resume();
        self.set_state(SyncState::SteadyState);
        self.emit(ControlEvent::Ready);

        let mut deadline = self.next_sync_deadline().await;
        let (mut data_open, mut control_open) = (true, true);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = data.next(), if data_open => match item {
                    Some(record) => {
                        if let Err(e) = self.merge_one(record).await {
                            self.report("subscriptions", &e);
                        }
                    }
                    None => {
                        warn!("Subscription data stream ended");
                        data_open = false;
                    }
                },
                message = control.next(), if control_open => match message {
                    Some(SubscriptionControl::Error(message)) => {
                        warn!(%message, "Subscription error");
                        self.emit(ControlEvent::Error {
                            source: "subscriptions".into(),
                            message,
                        });
                        self.deps.connectivity.socket_disconnected().await;
                    }
                    Some(SubscriptionControl::Connected) => {}
                    None => control_open = false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.set_state(SyncState::BaseOrDeltaSync);
                    if let Err(e) = self.sync_pass(&token).await {
                        self.report("sync", &e);
                    }
                    self.set_state(SyncState::SteadyState);
                    deadline = self.next_sync_deadline().await;
                }
            }
        }
        debug!("Online loop stopped");
    }

    /// Next full-sync deadline, never closer than the minimum resync sleep
    async fn next_sync_deadline(&self) -> Instant {
        let sync = &self.config.sync;
        let next_full_sync_at = match self.earliest_full_sync().await {
            Ok(at) => at,
            Err(e) => {
                self.report("sync", &e);
                None
            }
        };
        let now = chrono::Utc::now().timestamp_millis();
        Instant::now()
            + resync_wait(
                next_full_sync_at,
                now,
                sync.full_sync_interval(),
                sync.min_resync_sleep(),
            )
    }

    async fn earliest_full_sync(&self) -> Result<Option<i64>, SyncError> {
        let metas = self.read_metadata().await?;
        Ok(metas.iter().filter_map(ModelMetadata::next_full_sync_at).min())
    }

    async fn read_metadata(&self) -> Result<Vec<ModelMetadata>, SyncError> {
        let tx = self.storage.begin(ChangeOrigin::Remote).await?;
        let mut metas = Vec::new();
        for def in self.schema.syncable_models() {
            if let Some(meta) = tx.get_metadata(&def.name).await? {
                metas.push(meta);
            }
        }
        tx.rollback().await?;
        Ok(metas)
    }

    // ========================================================================
    // T248: base/delta sync pass
    // ========================================================================

    #[instrument(skip_all)]
    async fn sync_pass(&self, token: &CancellationToken) -> Result<(), SyncError> {
        let now = chrono::Utc::now().timestamp_millis();
        let requests: Vec<ModelSyncRequest> = self
            .read_metadata()
            .await?
            .into_iter()
            .map(|meta| ModelSyncRequest {
                last_sync: if meta.needs_full_sync(now) {
                    None
                } else {
                    meta.last_sync
                },
                filter: self.sync_expressions.get(&meta.model).map(Predicate::to_filter),
                limit: self.config.sync.page_limit,
                model: meta.model,
            })
            .collect();
        if requests.is_empty() {
            return Ok(());
        }

        let models = requests.iter().map(|r| r.model.clone()).collect();
        self.emit(ControlEvent::SyncQueriesStarted { models });

        let mut pages = self
            .deps
            .sync_feed
            .start(requests)
            .await
            .map_err(|e| SyncError::Feed(format!("{e:#}")))?;
        let mut counts: HashMap<String, MergeCounts> = HashMap::new();

        loop {
            let page = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                page = pages.next() => page,
            };
            let Some(page) = page else { break };
            let page = page.map_err(|e| SyncError::Feed(format!("{e:#}")))?;
            self.apply_page(page, &mut counts).await?;
        }

        self.emit(ControlEvent::SyncQueriesReady);
        Ok(())
    }

    /// Merges one page and, on a model's last page, advances its cursor
    async fn apply_page(
        &self,
        page: SyncPage,
        counts: &mut HashMap<String, MergeCounts>,
    ) -> Result<(), SyncError> {
        let def: Arc<ModelDefinition> = self.schema.model(&page.model)?.clone();
        let counter = counts.entry(def.name.clone()).or_default();

        let tx = self.storage.begin(ChangeOrigin::Remote).await?;
        let pending = self.outbox.get_model_ids(tx.as_ref(), &def.name).await?;

        let mut batch = Vec::with_capacity(page.items.len());
        for item in page.items {
            if pending.contains(&item.model_id(&def)?) {
                if let Some(op) = self.merger.merge(tx.as_ref(), item, &def).await? {
                    counter.tally(op);
                }
            } else {
                batch.push(item);
            }
        }
        for (_, op) in self.merger.merge_page(tx.as_ref(), batch, &def).await? {
            counter.tally(op);
        }

        if page.done {
            let mut meta = tx.get_metadata(&def.name).await?.unwrap_or_else(|| {
                ModelMetadata::new(
                    page.namespace.clone(),
                    def.name.clone(),
                    self.config.sync.full_sync_interval().as_millis() as i64,
                )
            });
            meta.last_sync = Some(page.started_at);
            if page.is_full_sync {
                meta.last_full_sync = Some(page.started_at);
            }
            tx.put_metadata(&meta).await?;
        }
        tx.commit().await?;

        if page.done {
            let done = counts.remove(&def.name).unwrap_or_default();
            info!(
                model = %def.name,
                full = page.is_full_sync,
                created = done.created,
                updated = done.updated,
                deleted = done.deleted,
                "Model synced"
            );
            self.synced_models.insert(def.name.clone());
            self.emit(ControlEvent::ModelSynced {
                model: def.name.clone(),
                is_full_sync: page.is_full_sync,
                created: done.created,
                updated: done.updated,
                deleted: done.deleted,
            });
        }
        Ok(())
    }
}

/// Time until the next sync pass
///
/// Waits for the earliest due full sync, or a whole `interval` when no model
/// has one scheduled, and never less than `floor`.
fn resync_wait(
    next_full_sync_at: Option<i64>,
    now_ms: i64,
    interval: Duration,
    floor: Duration,
) -> Duration {
    let wait = match next_full_sync_at {
        Some(at) => Duration::from_millis(at.saturating_sub(now_ms).max(0) as u64),
        None => interval,
    };
    wait.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(3600);
    const FLOOR: Duration = Duration::from_millis(1000);

    #[test]
    fn test_resync_waits_until_due_full_sync() {
        let wait = resync_wait(Some(60_000), 10_000, INTERVAL, FLOOR);
        assert_eq!(wait, Duration::from_millis(50_000));
    }

    #[test]
    fn test_resync_wait_is_clamped_to_floor() {
        // Due in 200ms, and already overdue
        assert_eq!(resync_wait(Some(10_200), 10_000, INTERVAL, FLOOR), FLOOR);
        assert_eq!(resync_wait(Some(5_000), 10_000, INTERVAL, FLOOR), FLOOR);
    }

    #[test]
    fn test_resync_without_schedule_waits_full_interval() {
        assert_eq!(resync_wait(None, 10_000, INTERVAL, FLOOR), INTERVAL);
        assert_eq!(
            resync_wait(None, 10_000, Duration::from_millis(10), FLOOR),
            FLOOR
        );
    }
}
