//! Outbox - durable FIFO of local mutations awaiting the remote service
//!
//! Events live in the storage adapter's mutation table and every operation
//! runs inside a caller-provided storage transaction, so read-modify-write
//! sequences (coalescing, version propagation) are atomic with respect to
//! merges and other enqueues.
//!
//! ## Coalescing
//!
//! At most one pending event exists per record id, besides the event
//! currently in flight, which is never modified:
//!
//! | pending | incoming | result                                  |
//! |---------|----------|-----------------------------------------|
//! | CREATE  | UPDATE   | CREATE carrying the merged field values |
//! | UPDATE  | UPDATE   | UPDATE carrying the merged field values |
//! | any     | DELETE   | DELETE                                  |
//! | DELETE  | CREATE / UPDATE | the incoming event               |
//!
//! The merged event keeps the pending event's id and queue position.

use std::collections::HashSet;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use localsync_core::domain::{
    ModelInstance, MutationEvent, MutationOperation, LAST_CHANGED_AT_FIELD, VERSION_FIELD,
};
use localsync_core::ports::{IStorageTransaction, StorageResult};

/// Queue of unsent local mutations
#[derive(Debug, Default)]
pub struct Outbox {
    in_flight: Mutex<Option<Uuid>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the event handed out by the last `peek`
    pub fn in_flight(&self) -> Option<Uuid> {
        *self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_in_flight(&self, id: Option<Uuid>) {
        *self.in_flight.lock().unwrap_or_else(|p| p.into_inner()) = id;
    }

    /// Releases the in-flight marker without dequeuing (e.g. on pause)
    pub fn clear_in_flight(&self) {
        self.set_in_flight(None);
    }

    // ========================================================================
    // T211: enqueue with coalescing
    // ========================================================================

    /// Adds `event`, coalescing it into the pending event for the same record
    pub async fn enqueue(
        &self,
        tx: &dyn IStorageTransaction,
        event: MutationEvent,
    ) -> StorageResult<MutationEvent> {
        let in_flight = self.in_flight();
        let pending = tx
            .mutations_for(&event.model_name, &event.model_id)
            .await?
            .into_iter()
            .filter(|e| Some(e.id) != in_flight)
            .collect::<Vec<_>>();

        let Some((last, stale)) = pending.split_last() else {
            debug!(model = %event.model_name, id = %event.model_id, op = %event.operation, "Enqueued mutation");
            return tx.put_mutation(event).await;
        };

        // Only one pending event per id is expected; fold any leftovers away
        for extra in stale {
            warn!(model = %extra.model_name, id = %extra.model_id, "Removing duplicate pending mutation");
            tx.remove_mutation(extra.id).await?;
        }

        let merged = coalesce(last.clone(), event)?;
        debug!(
            model = %merged.model_name,
            id = %merged.model_id,
            op = %merged.operation,
            sequence = merged.sequence,
            "Coalesced mutation"
        );
        tx.put_mutation(merged).await
    }

    // ========================================================================
    // T212: peek / dequeue / requeue
    // ========================================================================

    /// Oldest event; marks it as in flight
    pub async fn peek(&self, tx: &dyn IStorageTransaction) -> StorageResult<Option<MutationEvent>> {
        let head = tx.mutation_head().await?;
        self.set_in_flight(head.as_ref().map(|e| e.id));
        Ok(head)
    }

    /// Removes the head event
    ///
    /// When the remote accepted it, `accepted` is the record it returned;
    /// its `_version` and `_lastChangedAt` are carried into any later event
    /// for the same record so the next send presents the current version.
    pub async fn dequeue(
        &self,
        tx: &dyn IStorageTransaction,
        accepted: Option<&ModelInstance>,
        operation: Option<MutationOperation>,
    ) -> StorageResult<Option<MutationEvent>> {
        let Some(head) = tx.mutation_head().await? else {
            self.set_in_flight(None);
            return Ok(None);
        };
        if let Some(in_flight) = self.in_flight() {
            if in_flight != head.id {
                warn!(expected = %in_flight, found = %head.id, "Outbox head changed while in flight");
            }
        }

        tx.remove_mutation(head.id).await?;
        self.set_in_flight(None);

        if let (Some(record), false) = (accepted, operation == Some(MutationOperation::Delete)) {
            self.sync_versions(tx, &head, record).await?;
        }
        Ok(Some(head))
    }

    /// Rewrites the in-flight event in place (same id, same position)
    pub async fn requeue(
        &self,
        tx: &dyn IStorageTransaction,
        event: MutationEvent,
    ) -> StorageResult<MutationEvent> {
        tx.put_mutation(event).await
    }

    async fn sync_versions(
        &self,
        tx: &dyn IStorageTransaction,
        dequeued: &MutationEvent,
        record: &ModelInstance,
    ) -> StorageResult<()> {
        let Some(version) = record.version() else {
            return Ok(());
        };
        for event in tx
            .mutations_for(&dequeued.model_name, &dequeued.model_id)
            .await?
        {
            let data = event
                .record()?
                .with(VERSION_FIELD, Value::from(version))
                .with(LAST_CHANGED_AT_FIELD, record.get(LAST_CHANGED_AT_FIELD).clone());
            tx.put_mutation(MutationEvent {
                data: data.to_value().to_string(),
                ..event
            })
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // T213: inspection
    // ========================================================================

    pub async fn get_for_model(
        &self,
        tx: &dyn IStorageTransaction,
        model: &str,
        model_id: &str,
    ) -> StorageResult<Vec<MutationEvent>> {
        tx.mutations_for(model, model_id).await
    }

    /// Ids of `model` records with pending events
    pub async fn get_model_ids(
        &self,
        tx: &dyn IStorageTransaction,
        model: &str,
    ) -> StorageResult<HashSet<String>> {
        tx.mutation_model_ids(model).await
    }

    pub async fn len(&self, tx: &dyn IStorageTransaction) -> StorageResult<usize> {
        Ok(tx.all_mutations().await?.len())
    }

    pub async fn is_empty(&self, tx: &dyn IStorageTransaction) -> StorageResult<bool> {
        Ok(tx.mutation_head().await?.is_none())
    }
}

/// Folds `incoming` into the pending event `pending`
fn coalesce(pending: MutationEvent, incoming: MutationEvent) -> StorageResult<MutationEvent> {
    use MutationOperation::{Create, Delete, Update};

    let (operation, data) = match (pending.operation, incoming.operation) {
        (_, Delete) => (Delete, incoming.data),
        (Delete, op) => (op, incoming.data),
        (Create, _) => (Create, merge_data(&pending, &incoming)?),
        (Update, op) => (op, merge_data(&pending, &incoming)?),
    };

    Ok(MutationEvent {
        id: pending.id,
        sequence: pending.sequence,
        model_name: pending.model_name,
        model_id: pending.model_id,
        operation,
        data,
        condition: incoming.condition,
    })
}

fn merge_data(pending: &MutationEvent, incoming: &MutationEvent) -> StorageResult<String> {
    let merged = pending.record()?.overlay(&incoming.record()?.fields);
    Ok(merged.to_value().to_string())
}
