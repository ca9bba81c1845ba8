//! Inbound data ports: connectivity, live subscriptions and base/delta sync
//!
//! All three use `anyhow::Result` because their failures are transport
//! specific; the orchestrator only needs to know that a step failed.

use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::domain::ModelInstance;

/// Network reachability as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub online: bool,
}

/// Port trait for connectivity monitoring
#[async_trait::async_trait]
pub trait IConnectivityMonitor: Send + Sync {
    /// Stream of status transitions; the first item is the current status
    fn status(&self) -> BoxStream<'static, ConnectionStatus>;

    /// Hint that the realtime socket dropped, so the monitor can check again
    async fn socket_disconnected(&self);
}

/// Control messages emitted by a subscription feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionControl {
    Connected,
    Error(String),
}

/// The two halves of an open subscription
pub struct SubscriptionStreams {
    pub control: BoxStream<'static, SubscriptionControl>,
    pub data: BoxStream<'static, ModelInstance>,
}

/// Port trait for realtime remote change subscriptions
#[async_trait::async_trait]
pub trait ISubscriptionFeed: Send + Sync {
    async fn start(&self) -> anyhow::Result<SubscriptionStreams>;

    async fn stop(&self);
}

/// What to fetch for one model during a sync pass
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSyncRequest {
    pub model: String,
    /// `None` requests a full (base) sync
    pub last_sync: Option<i64>,
    /// Sync expression filter, if one is configured for the model
    pub filter: Option<Value>,
    /// Maximum records per page
    pub limit: u32,
}

/// One page of base/delta sync results
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPage {
    pub namespace: String,
    pub model: String,
    pub items: Vec<ModelInstance>,
    /// Last page for this model in the current pass
    pub done: bool,
    /// Server timestamp when this model's pass began (epoch millis)
    pub started_at: i64,
    pub is_full_sync: bool,
}

/// Port trait for base/delta sync queries
#[async_trait::async_trait]
pub trait ISyncFeed: Send + Sync {
    async fn start(
        &self,
        requests: Vec<ModelSyncRequest>,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<SyncPage>>>;
}
