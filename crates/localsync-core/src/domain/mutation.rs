//! Outbox and sync bookkeeping entities

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::instance::{ModelInstance, OpType};

/// Remote operation a queued mutation will perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOperation::Create => "CREATE",
            MutationOperation::Update => "UPDATE",
            MutationOperation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(MutationOperation::Create),
            "UPDATE" => Some(MutationOperation::Update),
            "DELETE" => Some(MutationOperation::Delete),
            _ => None,
        }
    }
}

impl From<OpType> for MutationOperation {
    fn from(op: OpType) -> Self {
        match op {
            OpType::Insert => MutationOperation::Create,
            OpType::Update => MutationOperation::Update,
            OpType::Delete => MutationOperation::Delete,
        }
    }
}

impl std::fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation waiting to be sent to the remote service
///
/// `sequence` is assigned by storage on first insert (0 until then) and
/// defines FIFO order. Coalescing keeps the original sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub id: Uuid,
    pub model_name: String,
    pub model_id: String,
    pub operation: MutationOperation,
    /// JSON object of the record fields
    pub data: String,
    /// JSON filter object, `{}` when unconditional
    pub condition: String,
    pub sequence: i64,
}

impl MutationEvent {
    pub fn new(
        model_id: impl Into<String>,
        operation: MutationOperation,
        record: &ModelInstance,
        condition: Option<&Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_name: record.model.clone(),
            model_id: model_id.into(),
            operation,
            data: record.to_value().to_string(),
            condition: condition
                .map(|c| c.to_string())
                .unwrap_or_else(|| "{}".to_string()),
            sequence: 0,
        }
    }

    pub fn record(&self) -> Result<ModelInstance, serde_json::Error> {
        let fields = serde_json::from_str(&self.data)?;
        Ok(ModelInstance::new(self.model_name.clone(), fields))
    }

    /// Parsed condition, `None` when unconditional
    pub fn condition_filter(&self) -> Result<Option<Value>, serde_json::Error> {
        let value: Value = serde_json::from_str(&self.condition)?;
        Ok(match &value {
            Value::Object(map) if map.is_empty() => None,
            Value::Null => None,
            _ => Some(value),
        })
    }
}

/// Per-model sync bookkeeping; timestamps are epoch millis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub namespace: String,
    pub model: String,
    pub last_sync: Option<i64>,
    pub last_full_sync: Option<i64>,
    pub full_sync_interval: i64,
    pub last_sync_predicate_hash: Option<String>,
}

impl ModelMetadata {
    pub fn new(namespace: impl Into<String>, model: impl Into<String>, interval_ms: i64) -> Self {
        Self {
            namespace: namespace.into(),
            model: model.into(),
            last_sync: None,
            last_full_sync: None,
            full_sync_interval: interval_ms,
            last_sync_predicate_hash: None,
        }
    }

    /// A full sync is due when none happened yet or its interval elapsed
    pub fn needs_full_sync(&self, now_ms: i64) -> bool {
        match self.last_full_sync {
            Some(last) => now_ms >= last + self.full_sync_interval,
            None => true,
        }
    }

    /// Epoch millis when the next full sync is due
    pub fn next_full_sync_at(&self) -> Option<i64> {
        self.last_full_sync.map(|last| last + self.full_sync_interval)
    }
}
