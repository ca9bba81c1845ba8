//! Model merger - applies remote records to the local store
//!
//! Inbound records never overwrite a record that still has a pending outbox
//! event: the local edit wins and will be reconciled when it is sent.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use localsync_core::domain::{ModelDefinition, ModelInstance, OpType};
use localsync_core::ports::{IStorageTransaction, StorageResult};

use crate::outbox::Outbox;

pub struct ModelMerger {
    outbox: Arc<Outbox>,
}

impl ModelMerger {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }

    /// Merges one record; `None` when skipped or when a tombstone had
    /// nothing to delete
    pub async fn merge(
        &self,
        tx: &dyn IStorageTransaction,
        remote: ModelInstance,
        def: &ModelDefinition,
    ) -> StorageResult<Option<OpType>> {
        let id = remote.model_id(def)?;
        if !self
            .outbox
            .get_for_model(tx, &def.name, &id)
            .await?
            .is_empty()
        {
            debug!(model = %def.name, id = %id, "Pending local mutation wins over remote record");
            return Ok(None);
        }

        let saved = tx.batch_save(&def.name, vec![remote]).await?;
        Ok(saved.into_iter().next().map(|(_, op)| op))
    }

    /// Merges a page in one batch; later duplicates of a key win
    ///
    /// Callers remove records with pending outbox events beforehand.
    pub async fn merge_page(
        &self,
        tx: &dyn IStorageTransaction,
        items: Vec<ModelInstance>,
        def: &ModelDefinition,
    ) -> StorageResult<Vec<(ModelInstance, OpType)>> {
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(items.len());
        let mut unique: Vec<ModelInstance> = Vec::with_capacity(items.len());
        for item in items {
            let key = item.key_string(def)?;
            match positions.get(&key) {
                Some(&at) => unique[at] = item,
                None => {
                    positions.insert(key, unique.len());
                    unique.push(item);
                }
            }
        }
        trace!(model = %def.name, count = unique.len(), "Merging page");
        tx.batch_save(&def.name, unique).await
    }
}
