//! Shared fixtures for localsync-sync integration tests
//!
//! Hand-written fakes for the remote-facing ports plus helpers to build a
//! store over an in-memory SQLite adapter.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc, watch};

use localsync_cache::{DatabasePool, SqliteStorageAdapter};
use localsync_core::config::{Config, ConfigBuilder};
use localsync_core::domain::{FieldDefinition, ModelDefinition, ModelInstance, Relationship, ScalarType, Schema};
use localsync_core::ports::{
    AuthMode, ConnectionStatus, IAuthProvider, IConnectivityMonitor, IRemoteApi, IStorageAdapter,
    ISubscriptionFeed, ISyncFeed, ModelSyncRequest, RemoteError, RemoteRequest,
    SubscriptionControl, SubscriptionStreams, SyncPage,
};
use localsync_sync::{ControlEvent, DataStore, DataStoreBuilder, SyncDependencies};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Schema and stores
// ============================================================================

/// Post 1-n Comment
pub fn test_schema() -> Arc<Schema> {
    let post = ModelDefinition::builder("Post")
        .field(FieldDefinition::scalar("id", ScalarType::Id).required())
        .field(FieldDefinition::scalar("title", ScalarType::String).required())
        .field(FieldDefinition::scalar("rating", ScalarType::Int))
        .field(FieldDefinition::relation(
            "comments",
            Relationship::has_many("Comment", &["postId"]),
        ))
        .build();
    let comment = ModelDefinition::builder("Comment")
        .field(FieldDefinition::scalar("id", ScalarType::Id).required())
        .field(FieldDefinition::scalar("content", ScalarType::String))
        .field(FieldDefinition::relation(
            "post",
            Relationship::belongs_to("Post", &["postId"]),
        ))
        .build();
    Arc::new(Schema::new("user", "1", vec![post, comment]).unwrap())
}

pub fn post(id: &str, title: &str) -> ModelInstance {
    ModelInstance::from_value("Post", json!({"id": id, "title": title})).unwrap()
}

pub fn test_config() -> Config {
    ConfigBuilder::new()
        .retry_delays_ms(10, 50)
        .min_resync_sleep_ms(50)
        .build()
}

pub async fn storage() -> Arc<dyn IStorageAdapter> {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    Arc::new(SqliteStorageAdapter::new(test_schema(), pool, 7))
}

/// Store without remote sync
pub async fn local_store() -> DataStore {
    DataStore::builder(test_schema(), storage().await).build()
}

/// A syncing store and handles to every fake behind it
pub struct Harness {
    pub store: DataStore,
    pub connectivity: Arc<FakeConnectivity>,
    pub subscriptions: Arc<FakeSubscriptions>,
    pub sync_feed: Arc<FakeSyncFeed>,
    pub remote: Arc<FakeRemote>,
}

impl Harness {
    pub async fn new(remote: Arc<FakeRemote>, online: bool) -> Self {
        Self::with(remote, online, |b| b).await
    }

    pub async fn with<F>(remote: Arc<FakeRemote>, online: bool, customize: F) -> Self
    where
        F: FnOnce(DataStoreBuilder) -> DataStoreBuilder,
    {
        Self::over(storage().await, remote, online, customize)
    }

    /// Builds the store over an existing adapter
    pub fn over<F>(
        storage: Arc<dyn IStorageAdapter>,
        remote: Arc<FakeRemote>,
        online: bool,
        customize: F,
    ) -> Self
    where
        F: FnOnce(DataStoreBuilder) -> DataStoreBuilder,
    {
        let connectivity = FakeConnectivity::new(online);
        let subscriptions = FakeSubscriptions::new();
        let sync_feed = FakeSyncFeed::new();
        let deps = SyncDependencies {
            remote: remote.clone(),
            auth: None,
            connectivity: connectivity.clone(),
            subscriptions: subscriptions.clone(),
            sync_feed: sync_feed.clone(),
        };
        let builder = DataStore::builder(test_schema(), storage)
            .config(test_config())
            .sync(deps);
        Self {
            store: customize(builder).build(),
            connectivity,
            subscriptions,
            sync_feed,
            remote,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<ControlEvent> {
        self.store.control_events().expect("store has sync enabled")
    }
}

/// Waits for the first control event matching `pred`
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<ControlEvent>, mut pred: F) -> ControlEvent
where
    F: FnMut(&ControlEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("control stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for control event")
}

pub async fn wait_outbox_empty(rx: &mut broadcast::Receiver<ControlEvent>) {
    wait_for(rx, |e| matches!(e, ControlEvent::OutboxStatus { is_empty: true })).await;
}

// ============================================================================
// Connectivity
// ============================================================================

pub struct FakeConnectivity {
    online: watch::Sender<bool>,
    disconnects: AtomicUsize,
}

impl FakeConnectivity {
    pub fn new(online: bool) -> Arc<Self> {
        let (tx, _) = watch::channel(online);
        Arc::new(Self {
            online: tx,
            disconnects: AtomicUsize::new(0),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IConnectivityMonitor for FakeConnectivity {
    fn status(&self) -> BoxStream<'static, ConnectionStatus> {
        let rx = self.online.subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first {
                rx.changed().await.ok()?;
            }
            let online = *rx.borrow_and_update();
            Some((ConnectionStatus { online }, (rx, false)))
        })
        .boxed()
    }

    async fn socket_disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

pub struct FakeSubscriptions {
    fail_handshake: AtomicBool,
    data: Mutex<Option<mpsc::UnboundedSender<ModelInstance>>>,
    control: Mutex<Option<mpsc::UnboundedSender<SubscriptionControl>>>,
    starts: AtomicUsize,
}

impl FakeSubscriptions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_handshake: AtomicBool::new(false),
            data: Mutex::new(None),
            control: Mutex::new(None),
            starts: AtomicUsize::new(0),
        })
    }

    pub fn fail_handshake(&self, fail: bool) {
        self.fail_handshake.store(fail, Ordering::SeqCst);
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Delivers a record on the live feed; false when not subscribed
    pub fn push(&self, record: ModelInstance) -> bool {
        match self.data.lock().unwrap().as_ref() {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }

    pub fn push_error(&self, message: &str) -> bool {
        match self.control.lock().unwrap().as_ref() {
            Some(tx) => tx.send(SubscriptionControl::Error(message.into())).is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ISubscriptionFeed for FakeSubscriptions {
    async fn start(&self) -> anyhow::Result<SubscriptionStreams> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        if self.fail_handshake.load(Ordering::SeqCst) {
            control_tx.send(SubscriptionControl::Error("socket refused".into()))?;
        } else {
            control_tx.send(SubscriptionControl::Connected)?;
        }
        *self.control.lock().unwrap() = Some(control_tx);
        *self.data.lock().unwrap() = Some(data_tx);

        Ok(SubscriptionStreams {
            control: receiver_stream(control_rx),
            data: receiver_stream(data_rx),
        })
    }

    async fn stop(&self) {
        self.control.lock().unwrap().take();
        self.data.lock().unwrap().take();
    }
}

// ============================================================================
// Base/delta sync
// ============================================================================

/// Serves queued records once, as a single done page per requested model
pub struct FakeSyncFeed {
    queued: Mutex<HashMap<String, Vec<ModelInstance>>>,
    requests: Mutex<Vec<ModelSyncRequest>>,
}

impl FakeSyncFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn queue(&self, record: ModelInstance) {
        self.queued
            .lock()
            .unwrap()
            .entry(record.model.clone())
            .or_default()
            .push(record);
    }

    pub fn requests_for(&self, model: &str) -> Vec<ModelSyncRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ISyncFeed for FakeSyncFeed {
    async fn start(
        &self,
        requests: Vec<ModelSyncRequest>,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<SyncPage>>> {
        let started_at = chrono::Utc::now().timestamp_millis();
        let mut queued = self.queued.lock().unwrap();
        let pages: Vec<anyhow::Result<SyncPage>> = requests
            .iter()
            .map(|request| {
                Ok(SyncPage {
                    namespace: "user".into(),
                    model: request.model.clone(),
                    items: queued.remove(&request.model).unwrap_or_default(),
                    done: true,
                    started_at,
                    is_full_sync: request.last_sync.is_none(),
                })
            })
            .collect();
        self.requests.lock().unwrap().extend(requests);
        Ok(stream::iter(pages).boxed())
    }
}

// ============================================================================
// Remote API
// ============================================================================

type Handler = Box<dyn Fn(&RemoteRequest) -> Result<Value, RemoteError> + Send + Sync>;

pub struct FakeRemote {
    handler: Handler,
    calls: Mutex<Vec<RemoteRequest>>,
    hang: AtomicBool,
}

impl FakeRemote {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&RemoteRequest) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
        })
    }

    /// Records every request and never answers while `hang` is set
    pub fn hanging() -> Arc<Self> {
        let remote = Self::echo();
        remote.hang.store(true, Ordering::SeqCst);
        remote
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Accepts every mutation, bumping `_version`
    pub fn echo() -> Arc<Self> {
        Self::new(|request| Ok(echo(request)))
    }

    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| operation_name(r) == name)
            .count()
    }
}

#[async_trait::async_trait]
impl IRemoteApi for FakeRemote {
    async fn execute(&self, request: RemoteRequest) -> Result<Value, RemoteError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        (self.handler)(&request)
    }
}

/// Root field of a generated document, e.g. `createPost`
pub fn operation_name(request: &RemoteRequest) -> String {
    request
        .query
        .lines()
        .nth(1)
        .and_then(|line| line.trim().split('(').next())
        .unwrap_or_default()
        .to_string()
}

/// `data` of a successful mutation: the input as stored remotely
pub fn echo(request: &RemoteRequest) -> Value {
    let name = operation_name(request);
    let mut record = request.variables["input"]
        .as_object()
        .cloned()
        .unwrap_or_default();
    let version = record.get("_version").and_then(Value::as_i64).unwrap_or(0) + 1;
    record.insert("_version".into(), json!(version));
    record.insert("_lastChangedAt".into(), json!(1_700_000_000_000i64));
    record.insert("_deleted".into(), json!(name.starts_with("delete")));

    let mut data = Map::new();
    data.insert(name, Value::Object(record));
    Value::Object(data)
}

/// Hands out a token per auth mode, refusing the ones listed
pub struct StaticAuth {
    pub refused: Vec<AuthMode>,
}

#[async_trait::async_trait]
impl IAuthProvider for StaticAuth {
    async fn token_for(&self, mode: AuthMode) -> anyhow::Result<Option<String>> {
        if self.refused.contains(&mode) {
            anyhow::bail!("no credentials for {mode:?}");
        }
        Ok(Some(format!("{mode:?}-token")))
    }
}
