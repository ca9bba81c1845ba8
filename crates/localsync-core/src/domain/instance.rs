//! Model instances
//!
//! A [`ModelInstance`] is one record of a model: the model name plus a JSON
//! object of field values. Instances are treated as immutable values;
//! [`ModelInstance::with`] and [`ModelInstance::without`] consume the
//! instance and return the updated copy.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::DomainError;
use super::schema::ModelDefinition;
use super::value;

/// Optimistic-concurrency token maintained by the remote service
pub const VERSION_FIELD: &str = "_version";
/// Remote modification timestamp (epoch millis)
pub const LAST_CHANGED_AT_FIELD: &str = "_lastChangedAt";
/// Tombstone flag
pub const DELETED_FIELD: &str = "_deleted";

static NULL: Value = Value::Null;

/// Kind of change applied to a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpType::Insert => "INSERT",
            OpType::Update => "UPDATE",
            OpType::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One record of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    pub model: String,
    pub fields: Map<String, Value>,
}

impl ModelInstance {
    pub fn new(model: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            model: model.into(),
            fields,
        }
    }

    /// Builds an instance from a JSON object value
    pub fn from_value(model: impl Into<String>, value: Value) -> Result<Self, DomainError> {
        let model = model.into();
        match value {
            Value::Object(fields) => Ok(Self { model, fields }),
            other => Err(DomainError::ValidationFailed(format!(
                "{} record must be an object, got {}",
                model, other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Field value, `null` when absent
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn without(mut self, field: &str) -> Self {
        self.fields.remove(field);
        self
    }

    /// Copies every field of `other` over this instance
    pub fn overlay(mut self, other: &Map<String, Value>) -> Self {
        for (k, v) in other {
            self.fields.insert(k.clone(), v.clone());
        }
        self
    }

    /// Ordered primary-key values
    pub fn key_values(&self, def: &ModelDefinition) -> Result<Vec<Value>, DomainError> {
        def.primary_key
            .iter()
            .map(|field| match self.get(field) {
                Value::Null => Err(DomainError::MissingPrimaryKey {
                    model: def.name.clone(),
                    field: field.clone(),
                }),
                v => Ok(v.clone()),
            })
            .collect()
    }

    /// Canonical storage key
    pub fn key_string(&self, def: &ModelDefinition) -> Result<String, DomainError> {
        Ok(value::key_string(&self.key_values(def)?))
    }

    /// Identifier used by the outbox: the raw id for single string keys,
    /// the canonical key tuple otherwise.
    pub fn model_id(&self, def: &ModelDefinition) -> Result<String, DomainError> {
        let values = self.key_values(def)?;
        match values.as_slice() {
            [Value::String(id)] => Ok(id.clone()),
            _ => Ok(value::key_string(&values)),
        }
    }

    pub fn version(&self) -> Option<i64> {
        self.get(VERSION_FIELD).as_i64()
    }

    pub fn last_changed_at(&self) -> Option<i64> {
        self.get(LAST_CHANGED_AT_FIELD).as_i64()
    }

    pub fn is_deleted(&self) -> bool {
        self.get(DELETED_FIELD).as_bool().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::schema::{FieldDefinition, ScalarType};

    fn def(keys: &[&str]) -> ModelDefinition {
        let mut builder = ModelDefinition::builder("Post").primary_key(keys);
        for key in keys {
            builder = builder.field(FieldDefinition::scalar(*key, ScalarType::String));
        }
        builder.build()
    }

    fn instance(value: Value) -> ModelInstance {
        ModelInstance::from_value("Post", value).unwrap()
    }

    #[test]
    fn test_model_id_single_key_is_raw() {
        let post = instance(json!({"id": "1", "title": "A"}));
        assert_eq!(post.model_id(&def(&["id"])).unwrap(), "1");
        assert_eq!(post.key_string(&def(&["id"])).unwrap(), r#"["1"]"#);
    }

    #[test]
    fn test_model_id_composite_key() {
        let post = instance(json!({"blog": "b", "slug": "s"}));
        assert_eq!(
            post.model_id(&def(&["blog", "slug"])).unwrap(),
            r#"["b","s"]"#
        );
    }

    #[test]
    fn test_missing_key_rejected() {
        let post = instance(json!({"title": "A"}));
        assert!(matches!(
            post.key_values(&def(&["id"])),
            Err(DomainError::MissingPrimaryKey { .. })
        ));
    }

    #[test]
    fn test_with_produces_new_instance() {
        let original = instance(json!({"id": "1", "title": "A"}));
        let updated = original.clone().with("title", json!("B"));
        assert_eq!(original.get("title"), &json!("A"));
        assert_eq!(updated.get("title"), &json!("B"));
        assert_eq!(updated.get("missing"), &Value::Null);
    }

    #[test]
    fn test_sync_fields() {
        let post = instance(json!({"id": "1", "_version": 3, "_deleted": true, "_lastChangedAt": 10}));
        assert_eq!(post.version(), Some(3));
        assert!(post.is_deleted());
        assert_eq!(post.last_changed_at(), Some(10));
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(ModelInstance::from_value("Post", json!([1, 2])).is_err());
    }
}
