//! The single-writer transaction
//!
//! Wraps one SQLite transaction plus the writer lock guard. Writes record
//! a [`StorageChange`] per affected record; `commit` publishes them.
//!
//! The inner connection lock is only held for the duration of a single
//! statement group, never across predicate evaluation, since evaluating a
//! relation-scoped condition reads through this same transaction.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::{Sqlite, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use localsync_core::condition::Predicate;
use localsync_core::domain::{
    value, DomainError, ModelDefinition, ModelInstance, ModelMetadata, MutationEvent, OpType,
    RelationKind,
};
use localsync_core::ports::{
    ChangeOrigin, DeleteTarget, IRecordReader, IStorageTransaction, Pagination, StorageChange,
    StorageError, StorageResult,
};

use crate::adapter::Shared;
use crate::{planner, store, CacheError};

type Saved = Vec<(ModelInstance, OpType)>;

pub(crate) struct SqliteTransaction {
    shared: Arc<Shared>,
    origin: ChangeOrigin,
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
    changes: Mutex<Vec<StorageChange>>,
    writer: Mutex<Option<OwnedMutexGuard<()>>>,
}

fn conn_of<'a>(
    tx: &'a mut Option<Transaction<'static, Sqlite>>,
) -> StorageResult<&'a mut SqliteConnection> {
    match tx {
        Some(tx) => Ok(&mut **tx),
        None => Err(StorageError::TransactionClosed),
    }
}

impl SqliteTransaction {
    pub(crate) fn new(
        shared: Arc<Shared>,
        origin: ChangeOrigin,
        tx: Transaction<'static, Sqlite>,
        writer: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            shared,
            origin,
            tx: Mutex::new(Some(tx)),
            changes: Mutex::new(Vec::new()),
            writer: Mutex::new(Some(writer)),
        }
    }

    async fn record_change(&self, element: ModelInstance, op: OpType, condition: Option<Value>) {
        self.changes.lock().await.push(StorageChange {
            sequence: 0,
            model: element.model.clone(),
            element,
            op,
            condition,
            origin: self.origin,
        });
    }

    async fn stored(&self, def: &ModelDefinition, key: &str) -> StorageResult<Option<ModelInstance>> {
        let mut guard = self.tx.lock().await;
        let conn = conn_of(&mut guard)?;
        Ok(store::get_record(conn, &def.name, key).await?)
    }

    async fn put(&self, def: &ModelDefinition, record: &ModelInstance) -> StorageResult<OpType> {
        let mut guard = self.tx.lock().await;
        let conn = conn_of(&mut guard)?;
        Ok(store::put_record(conn, def, record).await?)
    }

    async fn remove(&self, def: &ModelDefinition, key: &str) -> StorageResult<bool> {
        let mut guard = self.tx.lock().await;
        let conn = conn_of(&mut guard)?;
        Ok(store::delete_record(conn, &def.name, key).await?)
    }

    async fn release(&self) {
        self.changes.lock().await.clear();
        self.writer.lock().await.take();
    }

    /// Hands the staged changes to the registered hook; on failure the
    /// transaction is rolled back and the hook's error returned
    async fn run_commit_hook(&self) -> StorageResult<()> {
        let Some(hook) = self.shared.commit_hook() else {
            return Ok(());
        };
        let staged = self.changes.lock().await.clone();
        if staged.is_empty() {
            return Ok(());
        }
        if let Err(e) = hook.before_commit(self, &staged).await {
            tracing::warn!(error = %e, "Commit hook failed, rolling back");
            if let Some(tx) = self.tx.lock().await.take() {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "Rollback after hook failure failed");
                }
            }
            self.release().await;
            return Err(e);
        }
        Ok(())
    }

    /// Saves parents nested in `belongsTo` fields, the record itself, then
    /// children nested in `hasOne`/`hasMany` fields
    fn save_tree<'a>(
        &'a self,
        mut record: ModelInstance,
        condition: Option<&'a Predicate>,
    ) -> BoxFuture<'a, StorageResult<Saved>> {
        Box::pin(async move {
            let schema = self.shared.schema.clone();
            let def = schema.model(&record.model)?.clone();

            if let Some(condition) = condition {
                let key = record.key_string(&def)?;
                if let Some(stored) = self.stored(&def, &key).await? {
                    if !condition.matches(&stored, self.as_reader()).await? {
                        return Err(StorageError::ConditionalCheckFailed {
                            model: def.name.clone(),
                            id: record.model_id(&def)?,
                        });
                    }
                }
            }

            let mut saved = Vec::new();
            let mut children: Vec<(ModelInstance, Vec<String>)> = Vec::new();

            for (field, rel) in def.relations() {
                let Some(nested) = record.fields.remove(field) else {
                    continue;
                };
                match (rel.kind, nested) {
                    (RelationKind::BelongsTo, Value::Object(map)) => {
                        let parent = ModelInstance::new(rel.related_model.clone(), map);
                        let parent_def = schema.model(&rel.related_model)?;
                        let parent_key = parent.key_values(parent_def)?;
                        saved.extend(self.save_tree(parent, None).await?);
                        for (target, v) in rel.target_names.iter().zip(parent_key) {
                            record.fields.insert(target.clone(), v);
                        }
                    }
                    (RelationKind::HasOne, Value::Object(map)) => {
                        children.push((
                            ModelInstance::new(rel.related_model.clone(), map),
                            rel.associated_with.clone(),
                        ));
                    }
                    (RelationKind::HasMany, Value::Array(items)) => {
                        for item in items {
                            if let Value::Object(map) = item {
                                children.push((
                                    ModelInstance::new(rel.related_model.clone(), map),
                                    rel.associated_with.clone(),
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }

            validate_record(&def, &record)?;
            let op = self.put(&def, &record).await?;
            self.record_change(record.clone(), op, condition.map(Predicate::to_filter))
                .await;
            let root_key = record.key_values(&def)?;
            saved.push((record, op));

            for (child, associated_with) in children {
                let child = associated_with
                    .iter()
                    .zip(root_key.iter())
                    .fold(child, |c, (f, v)| c.with(f.clone(), v.clone()));
                saved.extend(self.save_tree(child, None).await?);
            }
            Ok(saved)
        })
    }

    /// Records `roots` and everything reachable through `hasOne`/`hasMany`,
    /// in discovery order
    async fn collect_cascade(&self, roots: Vec<ModelInstance>) -> StorageResult<Vec<ModelInstance>> {
        let schema = self.shared.schema.clone();
        let mut queue: VecDeque<ModelInstance> = roots.into();
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();

        while let Some(item) = queue.pop_front() {
            let def = schema.model(&item.model)?;
            let key = item.key_string(def)?;
            if !seen.insert((item.model.clone(), key)) {
                continue;
            }
            let key_values = item.key_values(def)?;
            for (_, rel) in def.relations() {
                if rel.kind == RelationKind::BelongsTo {
                    continue;
                }
                let pairs = rel
                    .associated_with
                    .iter()
                    .cloned()
                    .zip(key_values.iter().cloned())
                    .collect();
                let predicate = Predicate::equalities(&rel.related_model, pairs);
                queue.extend(self.query(&rel.related_model, Some(&predicate), None).await?);
            }
            ordered.push(item);
        }
        Ok(ordered)
    }

    /// Clears `belongsTo` references to a deleted record that no cascade covers
    async fn detach_referrers(
        &self,
        deleted: &ModelInstance,
        doomed: &HashSet<(String, String)>,
    ) -> StorageResult<Saved> {
        let schema = self.shared.schema.clone();
        let def = schema.model(&deleted.model)?;
        let key_values = deleted.key_values(def)?;
        let mut detached = Vec::new();

        for other in schema.models.values() {
            for (_, rel) in other.relations() {
                if rel.kind != RelationKind::BelongsTo || rel.related_model != def.name {
                    continue;
                }
                let pairs = rel
                    .target_names
                    .iter()
                    .cloned()
                    .zip(key_values.iter().cloned())
                    .collect();
                let predicate = Predicate::equalities(&other.name, pairs);
                for referrer in self.query(&other.name, Some(&predicate), None).await? {
                    let key = referrer.key_string(other)?;
                    if doomed.contains(&(other.name.clone(), key)) {
                        continue;
                    }
                    let updated = rel
                        .target_names
                        .iter()
                        .fold(referrer, |r, t| r.with(t.clone(), Value::Null));
                    self.put(other, &updated).await?;
                    self.record_change(updated.clone(), OpType::Update, None).await;
                    detached.push((updated, OpType::Update));
                }
            }
        }
        Ok(detached)
    }
}

/// Primary key present, required scalars set, no undeclared fields
fn validate_record(def: &ModelDefinition, record: &ModelInstance) -> Result<(), DomainError> {
    record.key_values(def)?;
    for field in &def.fields {
        if field.required && !field.is_relation() && record.get(&field.name).is_null() {
            return Err(DomainError::ValidationFailed(format!(
                "{}.{} is required",
                def.name, field.name
            )));
        }
    }
    for name in record.fields.keys() {
        if !def.is_scalar_field(name) && !name.starts_with('_') {
            return Err(DomainError::UnknownField {
                model: def.name.clone(),
                field: name.clone(),
            });
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl IRecordReader for SqliteTransaction {
    fn schema(&self) -> &Arc<localsync_core::domain::Schema> {
        &self.shared.schema
    }

    async fn query(
        &self,
        model: &str,
        predicate: Option<&Predicate>,
        pagination: Option<&Pagination>,
    ) -> StorageResult<Vec<ModelInstance>> {
        let def = self.shared.schema.model(model)?.clone();

        if let Some(p) = predicate.filter(|p| p.has_relation_scope()) {
            let items = p.optimized().fetch(self).await?;
            return Ok(match pagination {
                Some(page) => page.apply(items),
                None => items,
            });
        }

        let mut guard = self.tx.lock().await;
        let conn = conn_of(&mut guard)?;
        planner::run_query(conn, &def, predicate, pagination, self.shared.union_breakpoint).await
    }
}

#[async_trait::async_trait]
impl IStorageTransaction for SqliteTransaction {
    fn as_reader(&self) -> &dyn IRecordReader {
        self
    }

    async fn get(&self, model: &str, key: &[Value]) -> StorageResult<Option<ModelInstance>> {
        let def = self.shared.schema.model(model)?.clone();
        self.stored(&def, &value::key_string(key)).await
    }

    async fn save(&self, instance: ModelInstance, condition: Option<&Predicate>) -> StorageResult<Saved> {
        self.save_tree(instance, condition).await
    }

    async fn delete(&self, target: DeleteTarget, condition: Option<&Predicate>) -> StorageResult<Saved> {
        let schema = self.shared.schema.clone();

        let roots = match target {
            DeleteTarget::Instance(instance) => {
                let def = schema.model(&instance.model)?;
                let key = instance.key_string(def)?;
                let Some(stored) = self.stored(def, &key).await? else {
                    return Ok(Vec::new());
                };
                if let Some(condition) = condition {
                    if !condition.matches(&stored, self.as_reader()).await? {
                        return Err(StorageError::ConditionalCheckFailed {
                            model: def.name.clone(),
                            id: stored.model_id(def)?,
                        });
                    }
                }
                vec![stored]
            }
            DeleteTarget::Model { model, predicate } => {
                let candidates = self.query(&model, predicate.as_ref(), None).await?;
                match condition {
                    Some(condition) => {
                        let mut matched = Vec::with_capacity(candidates.len());
                        for item in candidates {
                            if condition.matches(&item, self.as_reader()).await? {
                                matched.push(item);
                            }
                        }
                        matched
                    }
                    None => candidates,
                }
            }
        };

        let ordered = self.collect_cascade(roots).await?;
        let mut doomed = HashSet::with_capacity(ordered.len());
        for item in &ordered {
            let def = schema.model(&item.model)?;
            doomed.insert((item.model.clone(), item.key_string(def)?));
        }

        let filter = condition.map(Predicate::to_filter);
        let mut result = Vec::new();
        // Children were discovered after their parents; remove them first
        for item in ordered.into_iter().rev() {
            let def = schema.model(&item.model)?;
            result.extend(self.detach_referrers(&item, &doomed).await?);
            let key = item.key_string(def)?;
            self.remove(def, &key).await?;
            self.record_change(item.clone(), OpType::Delete, filter.clone())
                .await;
            result.push((item, OpType::Delete));
        }
        Ok(result)
    }

    async fn batch_save(&self, model: &str, items: Vec<ModelInstance>) -> StorageResult<Saved> {
        let def = self.shared.schema.model(model)?.clone();
        let mut result = Vec::with_capacity(items.len());

        for mut item in items {
            for (field, _) in def.relations() {
                item.fields.remove(field);
            }
            let key = item.key_string(&def)?;
            if item.is_deleted() {
                if self.remove(&def, &key).await? {
                    self.record_change(item.clone(), OpType::Delete, None).await;
                    result.push((item, OpType::Delete));
                }
            } else {
                let op = self.put(&def, &item).await?;
                self.record_change(item.clone(), op, None).await;
                result.push((item, op));
            }
        }
        Ok(result)
    }

    async fn mutation_head(&self) -> StorageResult<Option<MutationEvent>> {
        let mut guard = self.tx.lock().await;
        Ok(store::mutation_head(conn_of(&mut guard)?).await?)
    }

    async fn mutations_for(&self, model: &str, model_id: &str) -> StorageResult<Vec<MutationEvent>> {
        let mut guard = self.tx.lock().await;
        Ok(store::mutations_for(conn_of(&mut guard)?, model, model_id).await?)
    }

    async fn mutation_model_ids(&self, model: &str) -> StorageResult<HashSet<String>> {
        let mut guard = self.tx.lock().await;
        Ok(store::mutation_model_ids(conn_of(&mut guard)?, model).await?)
    }

    async fn all_mutations(&self) -> StorageResult<Vec<MutationEvent>> {
        let mut guard = self.tx.lock().await;
        Ok(store::all_mutations(conn_of(&mut guard)?).await?)
    }

    async fn put_mutation(&self, event: MutationEvent) -> StorageResult<MutationEvent> {
        let mut guard = self.tx.lock().await;
        Ok(store::put_mutation(conn_of(&mut guard)?, event).await?)
    }

    async fn remove_mutation(&self, id: Uuid) -> StorageResult<()> {
        let mut guard = self.tx.lock().await;
        Ok(store::remove_mutation(conn_of(&mut guard)?, id).await?)
    }

    async fn get_metadata(&self, model: &str) -> StorageResult<Option<ModelMetadata>> {
        let mut guard = self.tx.lock().await;
        Ok(store::get_metadata(conn_of(&mut guard)?, model).await?)
    }

    async fn put_metadata(&self, metadata: &ModelMetadata) -> StorageResult<()> {
        let mut guard = self.tx.lock().await;
        Ok(store::put_metadata(conn_of(&mut guard)?, metadata).await?)
    }

    async fn commit(&self) -> StorageResult<Vec<StorageChange>> {
        if self.tx.lock().await.is_none() {
            return Err(StorageError::TransactionClosed);
        }
        if self.origin == ChangeOrigin::Local {
            self.run_commit_hook().await?;
        }

        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionClosed)?;
        tx.commit().await.map_err(CacheError::from)?;

        let changes = std::mem::take(&mut *self.changes.lock().await);
        let published = self.shared.publish(changes);
        self.release().await;
        tracing::trace!(changes = published.len(), origin = ?self.origin, "Transaction committed");
        Ok(published)
    }

    async fn rollback(&self) -> StorageResult<()> {
        let tx = self
            .tx
            .lock()
            .await
            .take()
            .ok_or(StorageError::TransactionClosed)?;
        tx.rollback().await.map_err(CacheError::from)?;
        self.release().await;
        tracing::trace!(origin = ?self.origin, "Transaction rolled back");
        Ok(())
    }
}
