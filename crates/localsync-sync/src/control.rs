//! Control-stream messages and orchestrator states

use localsync_core::domain::ModelInstance;

/// Orchestrator state machine
///
/// ```text
/// Idle -> SettingUpModels -> { Offline <-> ConnectingRealtime -> BaseOrDeltaSync -> SteadyState } -> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    SettingUpModels,
    Offline,
    ConnectingRealtime,
    BaseOrDeltaSync,
    SteadyState,
    Stopped,
}

/// Progress messages published on the control stream
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    StorageSubscribed,
    SubscriptionsEstablished,
    SyncQueriesStarted {
        models: Vec<String>,
    },
    SyncQueriesReady,
    ModelSynced {
        model: String,
        is_full_sync: bool,
        created: usize,
        updated: usize,
        deleted: usize,
    },
    OutboxMutationEnqueued {
        model: String,
        element: ModelInstance,
    },
    OutboxMutationProcessed {
        model: String,
        element: ModelInstance,
    },
    OutboxStatus {
        is_empty: bool,
    },
    NetworkStatus {
        active: bool,
    },
    Ready,
    /// A sub-loop failed; only that loop is affected
    Error {
        source: String,
        message: String,
    },
}
