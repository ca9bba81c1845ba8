//! End-to-end sync scenarios over fake remote ports

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{
    echo, operation_name, post, test_schema, wait_for, wait_outbox_empty, FakeRemote, Harness,
    StaticAuth,
};
use localsync_core::condition::{Predicate, PredicateBuilder};
use localsync_core::config::ConfigBuilder;
use localsync_core::domain::{ModelInstance, MutationOperation};
use localsync_core::ports::{
    AuthMode, ChangeOrigin, IStorageAdapter, RemoteError, ERROR_TYPE_CONFLICT_UNHANDLED,
};
use localsync_sync::merger::ModelMerger;
use localsync_sync::{
    ConflictData, ConflictHandler, ConflictResolution, ControlEvent, ErrorHandler,
    MutationErrorReport, SyncError, SyncState,
};

fn remote_post(id: &str, title: &str, version: i64, deleted: bool) -> ModelInstance {
    ModelInstance::from_value(
        "Post",
        json!({
            "id": id,
            "title": title,
            "_version": version,
            "_lastChangedAt": 1_700_000_000_000i64,
            "_deleted": deleted
        }),
    )
    .unwrap()
}

fn rated_above(min: i64) -> Predicate {
    PredicateBuilder::new(&test_schema(), "Post")
        .unwrap()
        .field("rating")
        .unwrap()
        .gt(min)
        .build()
}

/// Starts a store over `storage`, waits for its first Post sync, stops it
async fn sync_once(storage: Arc<dyn IStorageAdapter>, expression: Predicate) -> Harness {
    let h = Harness::over(storage, FakeRemote::echo(), true, |b| b.sync_expression(expression));
    let mut events = h.events();
    h.store.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ControlEvent::ModelSynced { model, .. } if model == "Post")).await;
    h.store.stop().await;
    h
}

// ============================================================================
// Offline behavior and coalescing
// ============================================================================

#[tokio::test]
async fn test_offline_save_is_queryable_and_queued() {
    let h = Harness::new(FakeRemote::echo(), false).await;

    h.store.save(post("p1", "A"), None).await.unwrap();

    let found = h.store.query_by_id("Post", "p1").await.unwrap().unwrap();
    assert_eq!(found.get("title"), &json!("A"));

    let pending = h.store.pending_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, MutationOperation::Create);
    assert_eq!(pending[0].model_id, "p1");
    assert_eq!(h.store.sync_state(), Some(SyncState::Offline));
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_create_then_update_coalesces_and_drains_online() {
    let h = Harness::new(FakeRemote::echo(), false).await;
    let mut events = h.events();

    h.store.save(post("p1", "A"), None).await.unwrap();
    h.store.save(post("p1", "B"), None).await.unwrap();

    let pending = h.store.pending_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, MutationOperation::Create);
    assert_eq!(pending[0].record().unwrap().get("title"), &json!("B"));

    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;

    let calls = h.remote.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(operation_name(&calls[0]), "createPost");
    assert_eq!(calls[0].variables["input"]["title"], json!("B"));
    assert!(h.store.pending_mutations().await.unwrap().is_empty());

    let stored = h.store.query_by_id("Post", "p1").await.unwrap().unwrap();
    assert_eq!(stored.get("_version"), &json!(1));
}

#[tokio::test]
async fn test_create_then_delete_sends_delete() {
    let h = Harness::new(FakeRemote::echo(), false).await;
    let mut events = h.events();

    let saved = h.store.save(post("p1", "A"), None).await.unwrap();
    h.store
        .delete(localsync_core::ports::DeleteTarget::Instance(saved), None)
        .await
        .unwrap();

    let pending = h.store.pending_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, MutationOperation::Delete);

    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;
    assert_eq!(h.remote.calls_to("deletePost"), 1);
    assert!(h.store.query_by_id("Post", "p1").await.unwrap().is_none());
}

// ============================================================================
// Inbound data
// ============================================================================

#[tokio::test]
async fn test_base_sync_then_delta_tombstone() {
    let h = Harness::new(FakeRemote::echo(), true).await;
    h.sync_feed.queue(remote_post("p1", "server", 1, false));
    let mut events = h.events();

    h.store.start().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::ModelSynced { model, is_full_sync: true, created: 1, .. } if model == "Post")
    })
    .await;
    assert!(h.store.query_by_id("Post", "p1").await.unwrap().is_some());

    // The restart runs a delta pass carrying the tombstone
    h.store.stop().await;
    h.sync_feed.queue(remote_post("p1", "server", 2, true));
    let mut events = h.events();
    h.store.start().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::ModelSynced { model, is_full_sync: false, deleted: 1, .. } if model == "Post")
    })
    .await;

    assert!(h.store.query_by_id("Post", "p1").await.unwrap().is_none());
    let requests = h.sync_feed.requests_for("Post");
    assert_eq!(requests.len(), 2);
    assert!(requests[0].last_sync.is_none());
    assert!(requests[1].last_sync.is_some());
}

#[tokio::test]
async fn test_live_feed_updates_store() {
    let h = Harness::new(FakeRemote::echo(), true).await;
    let mut events = h.events();
    h.store.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ControlEvent::Ready)).await;

    let mut changes = h.store.observe(Some("Post")).await.unwrap();
    assert!(h.subscriptions.push(remote_post("p9", "live", 3, false)));

    let change = tokio::time::timeout(common::WAIT, changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.element.get("title"), &json!("live"));
    // Remote-origin writes are not sent back
    assert!(h.store.pending_mutations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pending_local_edit_wins_over_sync_page() {
    let h = Harness::new(FakeRemote::echo(), false).await;
    let mut events = h.events();
    h.store.save(post("p1", "local"), None).await.unwrap();

    h.sync_feed.queue(remote_post("p1", "remote", 5, false));
    h.connectivity.set_online(true);

    wait_for(&mut events, |e| matches!(e, ControlEvent::ModelSynced { model, .. } if model == "Post")).await;
    let during = h.store.query_by_id("Post", "p1").await.unwrap().unwrap();
    assert_eq!(during.get("title"), &json!("local"));

    wait_outbox_empty(&mut events).await;
    let after = h.store.query_by_id("Post", "p1").await.unwrap().unwrap();
    assert_eq!(after.get("title"), &json!("local"));
}

#[tokio::test]
async fn test_local_write_and_outbox_event_commit_together() {
    let storage = common::storage().await;
    let h = Harness::over(storage.clone(), FakeRemote::echo(), false, |b| b);
    storage.init().await.unwrap();

    let tx = storage.begin(ChangeOrigin::Local).await.unwrap();
    tx.save(post("p1", "local"), None).await.unwrap();
    tx.commit().await.unwrap();

    // A merge that takes the writer lock straight after the local commit,
    // before any change-feed consumer has run
    let outbox = h.store.outbox().unwrap().clone();
    let tx = storage.begin(ChangeOrigin::Remote).await.unwrap();
    let pending = outbox.get_model_ids(tx.as_ref(), "Post").await.unwrap();
    assert!(pending.contains("p1"));

    let schema = test_schema();
    let def = schema.model("Post").unwrap();
    let merged = ModelMerger::new(outbox)
        .merge(tx.as_ref(), remote_post("p1", "remote", 5, false), def)
        .await
        .unwrap();
    assert!(merged.is_none());
    tx.commit().await.unwrap();

    let stored = h.store.query_by_id("Post", "p1").await.unwrap().unwrap();
    assert_eq!(stored.get("title"), &json!("local"));
    assert_eq!(h.store.pending_mutations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unchanged_sync_expression_resumes_delta_sync() {
    let storage = common::storage().await;
    let first = sync_once(storage.clone(), rated_above(3)).await;
    assert!(first.sync_feed.requests_for("Post")[0].last_sync.is_none());

    let second = sync_once(storage, rated_above(3)).await;
    assert!(second.sync_feed.requests_for("Post").last().unwrap().last_sync.is_some());
}

#[tokio::test]
async fn test_changed_sync_expression_forces_full_sync() {
    let storage = common::storage().await;
    sync_once(storage.clone(), rated_above(3)).await;

    let changed = sync_once(storage, rated_above(4)).await;
    let request = changed.sync_feed.requests_for("Post").last().cloned().unwrap();
    assert!(request.last_sync.is_none());
}

#[tokio::test]
async fn test_first_handshake_failure_fails_start() {
    let h = Harness::new(FakeRemote::echo(), true).await;
    h.subscriptions.fail_handshake(true);

    let err = h.store.start().await.unwrap_err();
    assert!(matches!(err, SyncError::Handshake(_)));
    assert_eq!(h.store.sync_state(), Some(SyncState::Stopped));

    h.subscriptions.fail_handshake(false);
    h.store.start().await.unwrap();
    assert_eq!(h.subscriptions.starts(), 2);
}

#[tokio::test]
async fn test_subscription_error_reports_disconnect() {
    let h = Harness::new(FakeRemote::echo(), true).await;
    let mut events = h.events();
    h.store.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ControlEvent::Ready)).await;

    assert!(h.subscriptions.push_error("connection lost"));
    wait_for(&mut events, |e| {
        matches!(e, ControlEvent::Error { source, .. } if source == "subscriptions")
    })
    .await;

    tokio::time::timeout(common::WAIT, async {
        while h.connectivity.disconnects() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// Mutation processing
// ============================================================================

struct CountingConflicts {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ConflictHandler for CountingConflicts {
    async fn on_conflict(&self, conflict: &ConflictData) -> ConflictResolution {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let version = conflict.remote.get("_version").clone();
        ConflictResolution::Retry(conflict.local.clone().with("_version", version))
    }
}

#[tokio::test]
async fn test_tenth_conflict_forces_discard() {
    let remote = FakeRemote::new(|request| {
        if operation_name(request) == "getPost" {
            return Ok(json!({"getPost": {
                "id": "p1", "title": "server", "_version": 7,
                "_lastChangedAt": 1_700_000_000_000i64, "_deleted": false
            }}));
        }
        Err(RemoteError::response(
            ERROR_TYPE_CONFLICT_UNHANDLED,
            "Conflict resolver rejects mutation.",
            Some(json!({"id": "p1", "title": "server", "_version": 7})),
        ))
    });
    let handler = Arc::new(CountingConflicts {
        calls: AtomicUsize::new(0),
    });
    let h = Harness::with(remote, false, |b| b.conflict_handler(handler.clone())).await;
    let mut events = h.events();

    h.store.save(post("p1", "mine"), None).await.unwrap();
    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 9);
    assert_eq!(h.remote.calls_to("createPost"), 10);
    assert_eq!(h.remote.calls_to("getPost"), 1);

    let stored = h.store.query_by_id("Post", "p1").await.unwrap().unwrap();
    assert_eq!(stored.get("title"), &json!("server"));
    assert_eq!(stored.get("_version"), &json!(7));
}

#[tokio::test]
async fn test_auth_fallback_advances_on_unauthorized() {
    let remote = FakeRemote::new(|request| match request.auth_mode {
        AuthMode::UserPool => Ok(echo(request)),
        _ => Err(RemoteError::response("Unauthorized", "Not Authorized", None)),
    });
    let config = ConfigBuilder::new()
        .retry_delays_ms(10, 50)
        .auth_modes(vec![AuthMode::ApiKey, AuthMode::Oidc, AuthMode::UserPool])
        .build();
    let h = Harness::with(remote, false, |b| b.config(config)).await;
    let mut events = h.events();

    h.store.save(post("p1", "A"), None).await.unwrap();
    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;

    let modes: Vec<_> = h.remote.calls().iter().map(|r| r.auth_mode).collect();
    assert_eq!(modes, vec![AuthMode::ApiKey, AuthMode::Oidc, AuthMode::UserPool]);
}

#[tokio::test]
async fn test_auth_provider_failure_skips_mode() {
    let config = ConfigBuilder::new()
        .auth_modes(vec![AuthMode::Oidc, AuthMode::ApiKey])
        .build();
    let connectivity = common::FakeConnectivity::new(false);
    let subscriptions = common::FakeSubscriptions::new();
    let sync_feed = common::FakeSyncFeed::new();
    let remote = FakeRemote::echo();
    let deps = localsync_sync::SyncDependencies {
        remote: remote.clone(),
        auth: Some(Arc::new(StaticAuth {
            refused: vec![AuthMode::Oidc],
        })),
        connectivity: connectivity.clone(),
        subscriptions,
        sync_feed,
    };
    let store = localsync_sync::DataStore::builder(common::test_schema(), common::storage().await)
        .config(config)
        .sync(deps)
        .build();
    let mut events = store.control_events().unwrap();

    store.save(post("p1", "A"), None).await.unwrap();
    connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;

    let calls = remote.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].auth_mode, AuthMode::ApiKey);
    assert_eq!(calls[0].auth_token.as_deref(), Some("ApiKey-token"));
}

#[tokio::test]
async fn test_network_errors_are_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let remote = FakeRemote::new(move |request| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(RemoteError::Network("connection reset".into()))
        } else {
            Ok(echo(request))
        }
    });
    let h = Harness::new(remote, false).await;
    let mut events = h.events();

    h.store.save(post("p1", "A"), None).await.unwrap();
    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

struct RecordingErrors {
    reports: Mutex<Vec<MutationErrorReport>>,
}

impl ErrorHandler for RecordingErrors {
    fn on_error(&self, report: &MutationErrorReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

#[tokio::test]
async fn test_terminal_error_goes_to_error_handler() {
    let remote = FakeRemote::new(|_| Err(RemoteError::response("BadRequest", "title too long", None)));
    let errors = Arc::new(RecordingErrors {
        reports: Mutex::new(Vec::new()),
    });
    let h = Harness::with(remote, false, |b| b.error_handler(errors.clone())).await;
    let mut events = h.events();

    h.store.save(post("p1", "A"), None).await.unwrap();
    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;

    let reports = errors.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].error_type.as_deref(), Some("BadRequest"));
    assert_eq!(reports[0].operation, MutationOperation::Create);
    assert!(h.store.pending_mutations().await.unwrap().is_empty());
    // The local record is left as saved
    assert!(h.store.query_by_id("Post", "p1").await.unwrap().is_some());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_going_offline_pauses_and_keeps_queueing() {
    let h = Harness::new(FakeRemote::echo(), true).await;
    let mut events = h.events();
    h.store.start().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ControlEvent::Ready)).await;

    h.connectivity.set_online(false);
    tokio::time::timeout(common::WAIT, async {
        while h.store.sync_state() != Some(SyncState::Offline) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    h.store.save(post("p1", "A"), None).await.unwrap();
    assert_eq!(h.store.pending_mutations().await.unwrap().len(), 1);

    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;
    assert_eq!(h.remote.calls_to("createPost"), 1);
}

#[tokio::test]
async fn test_stop_then_restart() {
    let h = Harness::new(FakeRemote::echo(), false).await;
    h.store.save(post("p1", "A"), None).await.unwrap();

    h.store.stop().await;
    assert_eq!(h.store.sync_state(), Some(SyncState::Stopped));

    // Any operation starts the store again; the outbox survived
    assert_eq!(h.store.pending_mutations().await.unwrap().len(), 1);
    assert_eq!(h.store.sync_state(), Some(SyncState::Offline));

    let mut events = h.events();
    h.connectivity.set_online(true);
    wait_outbox_empty(&mut events).await;
    assert_eq!(h.remote.calls_to("createPost"), 1);
}

#[tokio::test]
async fn test_stop_abandons_unanswered_request() {
    let h = Harness::new(FakeRemote::hanging(), true).await;
    h.store.save(post("p1", "A"), None).await.unwrap();
    tokio::time::timeout(common::WAIT, async {
        while h.remote.calls_to("createPost") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(common::WAIT, h.store.stop())
        .await
        .expect("stop waited on the remote");
    assert_eq!(h.store.sync_state(), Some(SyncState::Stopped));

    // The event stayed queued and goes out on the next run
    h.remote.set_hang(false);
    let mut events = h.events();
    h.store.start().await.unwrap();
    wait_outbox_empty(&mut events).await;
    assert_eq!(h.remote.calls_to("createPost"), 2);
}
