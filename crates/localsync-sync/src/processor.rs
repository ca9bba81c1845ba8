//! Mutation processor - drains the outbox into the remote service
//!
//! One long-running job sends the outbox head, waits for the remote verdict
//! and only then dequeues it, so events for the same record reach the
//! remote strictly in order.
//!
//! ## Error classes
//!
//! | Remote error        | Action                                              |
//! |---------------------|-----------------------------------------------------|
//! | network             | retry the same request with capped jittered backoff |
//! | unauthorized        | next configured auth mode; terminal when exhausted  |
//! | `ConflictUnhandled` | conflict handler: retry with a new record or discard |
//! | anything else       | error handler, then dequeue                         |

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use localsync_core::config::MutationsConfig;
use localsync_core::domain::{ModelDefinition, ModelInstance, MutationEvent, MutationOperation, Schema};
use localsync_core::ports::{
    AuthMode, ChangeOrigin, IAuthProvider, IRemoteApi, IStorageAdapter, RemoteError,
    RemoteRequest, ERROR_TYPE_UNAUTHORIZED,
};

use crate::conflict::{
    ConflictData, ConflictHandler, ConflictResolution, ErrorHandler, MutationErrorReport,
};
use crate::operations::{self, ModelOperations, Operation};
use crate::outbox::Outbox;
use crate::retry::{backoff_delay, is_retryable};
use crate::SyncError;

/// A mutation the remote accepted, or a conflict settled by discarding
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedMutation {
    pub operation: MutationOperation,
    pub model: String,
    /// The record as the remote now stores it
    pub record: ModelInstance,
    /// Whether more events are queued
    pub has_more: bool,
}

/// Emitted after every event leaves the outbox
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorEvent {
    Processed(ProcessedMutation),
    /// Terminal failure; already reported to the error handler
    Discarded {
        model: String,
        operation: MutationOperation,
        has_more: bool,
    },
}

/// Result of sending one event
enum Outcome {
    Accepted(ModelInstance),
    Rejected(MutationErrorReport),
    /// Cancelled or paused mid-retry; the event stays at the head
    Interrupted,
}

// ============================================================================
// T231: MutationProcessor
// ============================================================================

pub struct MutationProcessor {
    schema: Arc<Schema>,
    storage: Arc<dyn IStorageAdapter>,
    outbox: Arc<Outbox>,
    remote: Arc<dyn IRemoteApi>,
    auth: Option<Arc<dyn IAuthProvider>>,
    conflict_handler: Arc<dyn ConflictHandler>,
    error_handler: Arc<dyn ErrorHandler>,
    operations: HashMap<String, ModelOperations>,
    config: MutationsConfig,
    wake: Notify,
    paused: watch::Sender<bool>,
}

impl MutationProcessor {
    /// Creates a paused processor; call [`resume`](Self::resume) once online
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: Arc<Schema>,
        storage: Arc<dyn IStorageAdapter>,
        outbox: Arc<Outbox>,
        remote: Arc<dyn IRemoteApi>,
        auth: Option<Arc<dyn IAuthProvider>>,
        conflict_handler: Arc<dyn ConflictHandler>,
        error_handler: Arc<dyn ErrorHandler>,
        config: MutationsConfig,
    ) -> Self {
        let operations = operations::generate(&schema);
        let (paused, _) = watch::channel(true);
        Self {
            schema,
            storage,
            outbox,
            remote,
            auth,
            conflict_handler,
            error_handler,
            operations,
            config,
            wake: Notify::new(),
            paused,
        }
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        self.wake.notify_one();
    }

    /// Stops draining; a request in flight is abandoned and its event stays queued
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Signals that the outbox may have new work
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    // ========================================================================
    // T232: run loop
    // ========================================================================

    /// Drains the outbox whenever resumed or notified, until cancelled
    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        events: mpsc::UnboundedSender<ProcessorEvent>,
    ) {
        info!("Mutation processor starting");
        let mut paused_rx = self.paused.subscribe();

        loop {
            let failed = if self.is_paused() {
                false
            } else {
                match self.drain(&token, &events).await {
                    Ok(()) => false,
                    Err(e) => {
                        error!(error = %e, "Outbox drain failed");
                        self.outbox.clear_in_flight();
                        true
                    }
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => {}
                changed = paused_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.retry_base_delay()), if failed => {}
            }
        }

        self.outbox.clear_in_flight();
        info!("Mutation processor stopped");
    }

    async fn drain(
        &self,
        token: &CancellationToken,
        events: &mpsc::UnboundedSender<ProcessorEvent>,
    ) -> Result<(), SyncError> {
        loop {
            if token.is_cancelled() || self.is_paused() {
                return Ok(());
            }

            let head = {
                let tx = self.storage.begin(ChangeOrigin::Local).await?;
                let head = self.outbox.peek(tx.as_ref()).await?;
                tx.commit().await?;
                head
            };
            let Some(event) = head else {
                return Ok(());
            };

            match self.process(&event, token).await? {
                Outcome::Interrupted => {
                    self.outbox.clear_in_flight();
                    return Ok(());
                }
                Outcome::Accepted(record) => {
                    let has_more = self.settle(&event, Some(&record)).await?;
                    debug!(model = %event.model_name, id = %event.model_id, op = %event.operation, "Mutation processed");
                    let _ = events.send(ProcessorEvent::Processed(ProcessedMutation {
                        operation: event.operation,
                        model: event.model_name.clone(),
                        record,
                        has_more,
                    }));
                }
                Outcome::Rejected(report) => {
                    self.error_handler.on_error(&report);
                    let has_more = self.settle(&event, None).await?;
                    let _ = events.send(ProcessorEvent::Discarded {
                        model: event.model_name.clone(),
                        operation: event.operation,
                        has_more,
                    });
                }
            }
        }
    }

    /// Dequeues the head and reports whether more work is queued
    async fn settle(
        &self,
        event: &MutationEvent,
        accepted: Option<&ModelInstance>,
    ) -> Result<bool, SyncError> {
        let tx = self.storage.begin(ChangeOrigin::Local).await?;
        self.outbox
            .dequeue(tx.as_ref(), accepted, Some(event.operation))
            .await?;
        let has_more = !self.outbox.is_empty(tx.as_ref()).await?;
        tx.commit().await?;
        Ok(has_more)
    }

    // ========================================================================
    // T233: per-event processing
    // ========================================================================

    #[instrument(skip_all, fields(model = %event.model_name, id = %event.model_id, op = %event.operation))]
    async fn process(
        &self,
        event: &MutationEvent,
        token: &CancellationToken,
    ) -> Result<Outcome, SyncError> {
        let def = self.schema.model(&event.model_name)?.clone();
        let mut record = event.record()?;
        let Some(ops) = self.operations.get(&event.model_name) else {
            return Ok(Outcome::Rejected(report(
                event,
                &record,
                None,
                format!("{} is not synchronized with the remote", event.model_name),
            )));
        };
        let condition = event.condition_filter()?;
        let operation = ops.mutation(event.operation);
        let mut conflicts = 0u32;

        loop {
            let input = operations::mutation_input(&self.schema, &def, event.operation, &record);
            let variables = operations::mutation_variables(input, condition.clone());

            let error = match self.send(operation, variables, token).await {
                None => return Ok(Outcome::Interrupted),
                Some(Ok(data)) => {
                    return Ok(match response_record(&def, operation, &data) {
                        Some(accepted) => Outcome::Accepted(accepted),
                        None => Outcome::Rejected(report(
                            event,
                            &record,
                            None,
                            format!("{} returned no record", operation.name),
                        )),
                    });
                }
                Some(Err(e)) => e,
            };

            let remote = match (error.is_conflict(), error.conflict_data()) {
                (true, Some(data)) => ModelInstance::from_value(def.name.clone(), data.clone())?,
                _ => {
                    return Ok(Outcome::Rejected(report(
                        event,
                        &record,
                        error.error_type().map(str::to_string),
                        error.message(),
                    )));
                }
            };

            conflicts += 1;
            let resolution = if conflicts >= self.config.max_conflict_attempts {
                warn!(attempts = conflicts, "Conflict limit reached; discarding local mutation");
                ConflictResolution::Discard
            } else {
                self.conflict_handler
                    .on_conflict(&ConflictData {
                        local: record.clone(),
                        remote: remote.clone(),
                        operation: event.operation,
                        attempt: conflicts,
                    })
                    .await
            };

            match resolution {
                ConflictResolution::Retry(next) => {
                    debug!(attempt = conflicts, "Retrying mutation after conflict");
                    record = next;
                    let tx = self.storage.begin(ChangeOrigin::Local).await?;
                    self.outbox
                        .requeue(
                            tx.as_ref(),
                            MutationEvent {
                                data: record.to_value().to_string(),
                                ..event.clone()
                            },
                        )
                        .await?;
                    tx.commit().await?;
                }
                ConflictResolution::Discard => {
                    let current = self.fetch_current(&def, &record, token).await;
                    return Ok(Outcome::Accepted(current.unwrap_or(remote)));
                }
            }
        }
    }

    /// Authoritative remote copy of `record`, if the GET succeeds
    async fn fetch_current(
        &self,
        def: &ModelDefinition,
        record: &ModelInstance,
        token: &CancellationToken,
    ) -> Option<ModelInstance> {
        let get = &self.operations.get(&def.name)?.get;
        let variables = operations::get_variables(def, record);
        match self.send(get, variables, token).await? {
            Ok(data) => response_record(def, get, &data),
            Err(e) => {
                warn!(model = %def.name, error = %e, "Could not fetch remote record after discard");
                None
            }
        }
    }

    // ========================================================================
    // T234: transport with auth fallback and network retry
    // ========================================================================

    /// `None` when cancelled or paused while waiting to retry
    async fn send(
        &self,
        operation: &Operation,
        variables: Value,
        token: &CancellationToken,
    ) -> Option<Result<Value, RemoteError>> {
        let mut attempt = 0u32;
        loop {
            match self.send_with_fallback(operation, variables.clone(), token).await? {
                Err(e) if is_retryable(&e) => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.retry_base_delay(),
                        self.config.retry_max_delay(),
                    );
                    warn!(operation = %operation.name, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Network error, retrying");
                    attempt = attempt.saturating_add(1);

                    let mut paused_rx = self.paused.subscribe();
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = paused_rx.wait_for(|paused| *paused) => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                result => return Some(result),
            }
        }
    }

    /// Tries each configured auth mode in order while the remote answers
    /// Unauthorized; `None` when stopped or paused mid-request
    async fn send_with_fallback(
        &self,
        operation: &Operation,
        variables: Value,
        token: &CancellationToken,
    ) -> Option<Result<Value, RemoteError>> {
        let modes: &[AuthMode] = if self.config.auth_modes.is_empty() {
            &[AuthMode::ApiKey]
        } else {
            &self.config.auth_modes
        };

        let mut last_error = None;
        for &mode in modes {
            let auth_token = match &self.auth {
                Some(provider) => match provider.token_for(mode).await {
                    Ok(token) => token,
                    Err(e) => {
                        debug!(?mode, error = %e, "No credentials for auth mode");
                        continue;
                    }
                },
                None => None,
            };

            let request = RemoteRequest {
                query: operation.document.clone(),
                variables: variables.clone(),
                auth_mode: mode,
                auth_token,
            };
            let mut paused_rx = self.paused.subscribe();
            let result = tokio::select! {
                _ = token.cancelled() => return None,
                _ = paused_rx.wait_for(|paused| *paused) => return None,
                result = self.remote.execute(request) => result,
            };
            match result {
                Err(e) if e.is_unauthorized() => {
                    debug!(?mode, operation = %operation.name, "Unauthorized, trying next auth mode");
                    last_error = Some(e);
                }
                result => return Some(result),
            }
        }

        Some(Err(last_error.unwrap_or_else(|| {
            RemoteError::response(
                ERROR_TYPE_UNAUTHORIZED,
                format!("no usable auth mode for {}", operation.name),
                None,
            )
        })))
    }
}

fn response_record(
    def: &ModelDefinition,
    operation: &Operation,
    data: &Value,
) -> Option<ModelInstance> {
    match data.get(&operation.name) {
        Some(Value::Object(fields)) => Some(ModelInstance::new(def.name.clone(), fields.clone())),
        _ => None,
    }
}

fn report(
    event: &MutationEvent,
    record: &ModelInstance,
    error_type: Option<String>,
    message: String,
) -> MutationErrorReport {
    MutationErrorReport {
        model: event.model_name.clone(),
        operation: event.operation,
        record: record.clone(),
        error_type,
        message,
    }
}
