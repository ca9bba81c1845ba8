//! Row-level access to the record, index, outbox and metadata tables
//!
//! Every function takes a plain `&mut SqliteConnection` so the same code
//! serves pooled reads and the open writer transaction.
//!
//! ## Type Mapping
//!
//! | Domain Type      | SQL Type | Strategy                                  |
//! |------------------|----------|-------------------------------------------|
//! | ModelInstance    | TEXT     | JSON object of the flat record fields     |
//! | primary key      | TEXT     | canonical key tuple (`value::key_string`) |
//! | index key        | TEXT     | canonical tuple of the indexed fields     |
//! | Uuid             | TEXT     | hyphenated string                         |
//! | MutationOperation| TEXT     | `CREATE` / `UPDATE` / `DELETE`            |

use std::collections::HashSet;
use std::str::FromStr;

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use localsync_core::domain::{
    value, IndexDefinition, ModelDefinition, ModelInstance, ModelMetadata, MutationEvent,
    MutationOperation, OpType,
};

use crate::CacheError;

// ============================================================================
// Records
// ============================================================================

fn decode_record(store: &str, data: &str) -> Result<ModelInstance, CacheError> {
    let fields: Map<String, Value> = serde_json::from_str(data)?;
    Ok(ModelInstance::new(store, fields))
}

fn index_key(index: &IndexDefinition, record: &ModelInstance) -> String {
    let values: Vec<Value> = index
        .fields
        .iter()
        .map(|f| record.get(f).clone())
        .collect();
    value::key_string(&values)
}

pub(crate) async fn get_record(
    conn: &mut SqliteConnection,
    store: &str,
    pk: &str,
) -> Result<Option<ModelInstance>, CacheError> {
    let data: Option<String> =
        sqlx::query_scalar("SELECT data FROM records WHERE store = ? AND pk = ?")
            .bind(store)
            .bind(pk)
            .fetch_optional(&mut *conn)
            .await?;
    data.map(|d| decode_record(store, &d)).transpose()
}

/// Inserts or replaces a record and rewrites its index entries
pub(crate) async fn put_record(
    conn: &mut SqliteConnection,
    def: &ModelDefinition,
    record: &ModelInstance,
) -> Result<OpType, CacheError> {
    let pk = record
        .key_string(def)
        .map_err(|e| CacheError::QueryFailed(e.to_string()))?;

    let existed: Option<i64> = sqlx::query_scalar("SELECT 1 FROM records WHERE store = ? AND pk = ?")
        .bind(&def.name)
        .bind(&pk)
        .fetch_optional(&mut *conn)
        .await?;

    sqlx::query("INSERT OR REPLACE INTO records (store, pk, data) VALUES (?, ?, ?)")
        .bind(&def.name)
        .bind(&pk)
        .bind(record.to_value().to_string())
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM index_entries WHERE store = ? AND pk = ?")
        .bind(&def.name)
        .bind(&pk)
        .execute(&mut *conn)
        .await?;

    for index in &def.indexes {
        sqlx::query(
            "INSERT OR IGNORE INTO index_entries (store, index_name, key, pk) VALUES (?, ?, ?, ?)",
        )
        .bind(&def.name)
        .bind(&index.name)
        .bind(index_key(index, record))
        .bind(&pk)
        .execute(&mut *conn)
        .await?;
    }

    Ok(if existed.is_some() {
        OpType::Update
    } else {
        OpType::Insert
    })
}

/// Removes a record with its index entries; returns whether it existed
pub(crate) async fn delete_record(
    conn: &mut SqliteConnection,
    store: &str,
    pk: &str,
) -> Result<bool, CacheError> {
    sqlx::query("DELETE FROM index_entries WHERE store = ? AND pk = ?")
        .bind(store)
        .bind(pk)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM records WHERE store = ? AND pk = ?")
        .bind(store)
        .bind(pk)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Every record of a store, ordered by primary key
pub(crate) async fn scan(
    conn: &mut SqliteConnection,
    store: &str,
) -> Result<Vec<ModelInstance>, CacheError> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT data FROM records WHERE store = ? ORDER BY pk")
            .bind(store)
            .fetch_all(&mut *conn)
            .await?;
    rows.iter().map(|d| decode_record(store, d)).collect()
}

/// One page of a store in primary-key order, paged by SQLite
pub(crate) async fn scan_page(
    conn: &mut SqliteConnection,
    store: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<ModelInstance>, CacheError> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT data FROM records WHERE store = ? ORDER BY pk LIMIT ? OFFSET ?",
    )
    .bind(store)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|d| decode_record(store, d)).collect()
}

/// Records whose index `index_name` has exactly `key`
pub(crate) async fn index_lookup(
    conn: &mut SqliteConnection,
    store: &str,
    index_name: &str,
    key: &str,
) -> Result<Vec<ModelInstance>, CacheError> {
    let rows: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT r.data FROM index_entries i
        JOIN records r ON r.store = i.store AND r.pk = i.pk
        WHERE i.store = ? AND i.index_name = ? AND i.key = ?
        ORDER BY i.pk
        "#,
    )
    .bind(store)
    .bind(index_name)
    .bind(key)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|d| decode_record(store, d)).collect()
}

// ============================================================================
// Outbox
// ============================================================================

fn row_to_mutation(row: &SqliteRow) -> Result<MutationEvent, CacheError> {
    let id_str: String = row.get("id");
    let operation_str: String = row.get("operation");

    let id = Uuid::from_str(&id_str)
        .map_err(|e| CacheError::SerializationError(format!("invalid mutation id: {e}")))?;
    let operation = MutationOperation::parse(&operation_str).ok_or_else(|| {
        CacheError::SerializationError(format!("invalid mutation operation: {operation_str}"))
    })?;

    Ok(MutationEvent {
        id,
        model_name: row.get("model"),
        model_id: row.get("model_id"),
        operation,
        data: row.get("data"),
        condition: row.get("condition"),
        sequence: row.get("sequence"),
    })
}

const MUTATION_COLUMNS: &str = "sequence, id, model, model_id, operation, data, condition";

pub(crate) async fn mutation_head(
    conn: &mut SqliteConnection,
) -> Result<Option<MutationEvent>, CacheError> {
    let row = sqlx::query(&format!(
        "SELECT {MUTATION_COLUMNS} FROM mutation_events ORDER BY sequence ASC LIMIT 1"
    ))
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_mutation).transpose()
}

pub(crate) async fn mutations_for(
    conn: &mut SqliteConnection,
    model: &str,
    model_id: &str,
) -> Result<Vec<MutationEvent>, CacheError> {
    let rows = sqlx::query(&format!(
        "SELECT {MUTATION_COLUMNS} FROM mutation_events WHERE model = ? AND model_id = ? ORDER BY sequence ASC"
    ))
    .bind(model)
    .bind(model_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_mutation).collect()
}

pub(crate) async fn mutation_model_ids(
    conn: &mut SqliteConnection,
    model: &str,
) -> Result<HashSet<String>, CacheError> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT model_id FROM mutation_events WHERE model = ?")
            .bind(model)
            .fetch_all(&mut *conn)
            .await?;
    Ok(ids.into_iter().collect())
}

pub(crate) async fn all_mutations(
    conn: &mut SqliteConnection,
) -> Result<Vec<MutationEvent>, CacheError> {
    let rows = sqlx::query(&format!(
        "SELECT {MUTATION_COLUMNS} FROM mutation_events ORDER BY sequence ASC"
    ))
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_mutation).collect()
}

/// Appends a new event (sequence 0) or rewrites one in place
pub(crate) async fn put_mutation(
    conn: &mut SqliteConnection,
    mut event: MutationEvent,
) -> Result<MutationEvent, CacheError> {
    if event.sequence > 0 {
        sqlx::query(
            r#"
            UPDATE mutation_events
            SET id = ?, model = ?, model_id = ?, operation = ?, data = ?, condition = ?
            WHERE sequence = ?
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.model_name)
        .bind(&event.model_id)
        .bind(event.operation.as_str())
        .bind(&event.data)
        .bind(&event.condition)
        .bind(event.sequence)
        .execute(&mut *conn)
        .await?;
        return Ok(event);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO mutation_events (id, model, model_id, operation, data, condition)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event.id.to_string())
    .bind(&event.model_name)
    .bind(&event.model_id)
    .bind(event.operation.as_str())
    .bind(&event.data)
    .bind(&event.condition)
    .execute(&mut *conn)
    .await?;
    event.sequence = result.last_insert_rowid();
    Ok(event)
}

pub(crate) async fn remove_mutation(conn: &mut SqliteConnection, id: Uuid) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM mutation_events WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ============================================================================
// Sync metadata
// ============================================================================

pub(crate) async fn get_metadata(
    conn: &mut SqliteConnection,
    model: &str,
) -> Result<Option<ModelMetadata>, CacheError> {
    let row = sqlx::query(
        r#"
        SELECT model, namespace, last_sync, last_full_sync, full_sync_interval, last_sync_predicate_hash
        FROM model_metadata WHERE model = ?
        "#,
    )
    .bind(model)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|row| ModelMetadata {
        namespace: row.get("namespace"),
        model: row.get("model"),
        last_sync: row.get("last_sync"),
        last_full_sync: row.get("last_full_sync"),
        full_sync_interval: row.get("full_sync_interval"),
        last_sync_predicate_hash: row.get("last_sync_predicate_hash"),
    }))
}

pub(crate) async fn put_metadata(
    conn: &mut SqliteConnection,
    metadata: &ModelMetadata,
) -> Result<(), CacheError> {
    sqlx::query(
        r#"
        INSERT INTO model_metadata
            (model, namespace, last_sync, last_full_sync, full_sync_interval, last_sync_predicate_hash)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(model) DO UPDATE SET
            namespace = excluded.namespace,
            last_sync = excluded.last_sync,
            last_full_sync = excluded.last_full_sync,
            full_sync_interval = excluded.full_sync_interval,
            last_sync_predicate_hash = excluded.last_sync_predicate_hash
        "#,
    )
    .bind(&metadata.model)
    .bind(&metadata.namespace)
    .bind(metadata.last_sync)
    .bind(metadata.last_full_sync)
    .bind(metadata.full_sync_interval)
    .bind(&metadata.last_sync_predicate_hash)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
