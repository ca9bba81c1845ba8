//! Remote operation documents and inputs generated from the schema
//!
//! Each syncable model gets CREATE, UPDATE, DELETE and GET documents in
//! the remote service's GraphQL dialect. Mutation results are read from
//! `data[<operation name>]`.

use std::collections::HashMap;

use serde_json::{Map, Value};

use localsync_core::domain::{
    FieldKind, ModelDefinition, ModelInstance, MutationOperation, RelationKind, ScalarType, Schema,
    DELETED_FIELD, LAST_CHANGED_AT_FIELD, VERSION_FIELD,
};

const SYNC_SELECTION: [&str; 3] = [VERSION_FIELD, LAST_CHANGED_AT_FIELD, DELETED_FIELD];

/// One generated document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Root field name, e.g. `createPost`
    pub name: String,
    pub document: String,
}

/// Generated documents for one model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOperations {
    pub create: Operation,
    pub update: Operation,
    pub delete: Operation,
    pub get: Operation,
}

impl ModelOperations {
    pub fn for_model(def: &ModelDefinition) -> Self {
        let selection = selection_set(def);
        let model = &def.name;

        let mutation = |verb: &str| {
            let name = format!("{}{}", verb.to_lowercase(), model);
            let document = format!(
                "mutation {verb}{model}($input: {verb}{model}Input!, $condition: Model{model}ConditionInput) {{\n  {name}(input: $input, condition: $condition) {{\n{selection}\n  }}\n}}"
            );
            Operation { name, document }
        };

        let get = {
            let name = format!("get{model}");
            let params = def
                .primary_key
                .iter()
                .map(|k| format!("${k}: {}!", graphql_type(def, k)))
                .collect::<Vec<_>>()
                .join(", ");
            let args = def
                .primary_key
                .iter()
                .map(|k| format!("{k}: ${k}"))
                .collect::<Vec<_>>()
                .join(", ");
            let document = format!(
                "query Get{model}({params}) {{\n  {name}({args}) {{\n{selection}\n  }}\n}}"
            );
            Operation { name, document }
        };

        Self {
            create: mutation("Create"),
            update: mutation("Update"),
            delete: mutation("Delete"),
            get,
        }
    }

    pub fn mutation(&self, operation: MutationOperation) -> &Operation {
        match operation {
            MutationOperation::Create => &self.create,
            MutationOperation::Update => &self.update,
            MutationOperation::Delete => &self.delete,
        }
    }
}

/// Documents for every syncable model of `schema`
pub fn generate(schema: &Schema) -> HashMap<String, ModelOperations> {
    schema
        .syncable_models()
        .map(|def| (def.name.clone(), ModelOperations::for_model(def)))
        .collect()
}

fn selection_set(def: &ModelDefinition) -> String {
    def.scalar_field_names()
        .iter()
        .map(String::as_str)
        .chain(SYNC_SELECTION)
        .map(|f| format!("    {f}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn graphql_type(def: &ModelDefinition, field: &str) -> &'static str {
    match def.field(field).map(|f| &f.kind) {
        Some(FieldKind::Scalar(scalar)) => match scalar {
            ScalarType::Id => "ID",
            ScalarType::String => "String",
            ScalarType::Int => "Int",
            ScalarType::Float => "Float",
            ScalarType::Boolean => "Boolean",
            ScalarType::DateTime => "AWSDateTime",
            ScalarType::Json => "AWSJSON",
        },
        // Foreign keys implied by relations
        _ => "ID",
    }
}

// ============================================================================
// T221: Mutation input
// ============================================================================

/// Builds the `input` variable for a queued mutation
///
/// - CREATE / UPDATE: every field except read-only fields, owner fields
///   that are null, and relation fields; a `belongsTo` relation object is
///   replaced by its foreign-key scalars. `_version` is only sent on
///   UPDATE; `_lastChangedAt` and `_deleted` never are.
/// - DELETE: the primary-key fields and `_version`.
pub fn mutation_input(
    schema: &Schema,
    def: &ModelDefinition,
    operation: MutationOperation,
    record: &ModelInstance,
) -> Value {
    let mut input = Map::new();

    if operation == MutationOperation::Delete {
        for key in &def.primary_key {
            input.insert(key.clone(), record.get(key).clone());
        }
        if let Some(version) = record.fields.get(VERSION_FIELD) {
            input.insert(VERSION_FIELD.to_string(), version.clone());
        }
        return Value::Object(input);
    }

    for (name, value) in &record.fields {
        if name == LAST_CHANGED_AT_FIELD || name == DELETED_FIELD {
            continue;
        }
        if name == VERSION_FIELD {
            if operation == MutationOperation::Update {
                input.insert(name.clone(), value.clone());
            }
            continue;
        }
        if def.is_owner_field(name) && value.is_null() {
            continue;
        }
        match def.field(name) {
            Some(field) if field.read_only => {}
            Some(field) => match field.relationship() {
                Some(rel) if rel.kind == RelationKind::BelongsTo => {
                    if let Value::Object(parent) = value {
                        let related_key = schema
                            .model(&rel.related_model)
                            .map(|d| d.primary_key.clone())
                            .unwrap_or_default();
                        for (target, key) in rel.target_names.iter().zip(&related_key) {
                            let fk = parent.get(key).cloned().unwrap_or(Value::Null);
                            input.insert(target.clone(), fk);
                        }
                    }
                }
                Some(_) => {}
                None => {
                    input.insert(name.clone(), value.clone());
                }
            },
            None => {
                input.insert(name.clone(), value.clone());
            }
        }
    }
    Value::Object(input)
}

/// `{input, condition}` variables of a mutation request
pub fn mutation_variables(input: Value, condition: Option<Value>) -> Value {
    let mut variables = Map::new();
    variables.insert("input".into(), input);
    variables.insert("condition".into(), condition.unwrap_or(Value::Null));
    Value::Object(variables)
}

/// Primary-key variables of a GET request
pub fn get_variables(def: &ModelDefinition, record: &ModelInstance) -> Value {
    let variables: Map<String, Value> = def
        .primary_key
        .iter()
        .map(|k| (k.clone(), record.get(k).clone()))
        .collect();
    Value::Object(variables)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use localsync_core::domain::{FieldDefinition, Relationship};

    fn schema() -> Schema {
        let blog = ModelDefinition::builder("Blog")
            .field(FieldDefinition::scalar("id", ScalarType::Id))
            .build();
        let post = ModelDefinition::builder("Post")
            .field(FieldDefinition::scalar("id", ScalarType::Id))
            .field(FieldDefinition::scalar("title", ScalarType::String))
            .field(FieldDefinition::scalar("createdAt", ScalarType::DateTime).read_only())
            .field(FieldDefinition::scalar("owner", ScalarType::String))
            .field(FieldDefinition::relation(
                "blog",
                Relationship::belongs_to("Blog", &["blogId"]),
            ))
            .field(FieldDefinition::relation(
                "comments",
                Relationship::has_many("Comment", &["postId"]),
            ))
            .owner_field("owner")
            .build();
        let comment = ModelDefinition::builder("Comment")
            .field(FieldDefinition::scalar("id", ScalarType::Id))
            .field(FieldDefinition::relation(
                "post",
                Relationship::belongs_to("Post", &["postId"]),
            ))
            .build();
        Schema::new("user", "1", vec![blog, post, comment]).unwrap()
    }

    fn record() -> ModelInstance {
        ModelInstance::from_value(
            "Post",
            json!({
                "id": "1",
                "title": "Hello",
                "createdAt": "2024-01-01T00:00:00Z",
                "owner": null,
                "blog": {"id": "b9"},
                "comments": [{"id": "c1"}],
                "_version": 3,
                "_lastChangedAt": 1000,
                "_deleted": false
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_create_input_filters_fields() {
        let schema = schema();
        let def = schema.model("Post").unwrap();
        let input = mutation_input(&schema, def, MutationOperation::Create, &record());
        assert_eq!(input, json!({"id": "1", "title": "Hello", "blogId": "b9"}));
    }

    #[test]
    fn test_update_input_carries_version() {
        let schema = schema();
        let def = schema.model("Post").unwrap();
        let input = mutation_input(&schema, def, MutationOperation::Update, &record());
        assert_eq!(input["_version"], json!(3));
        assert!(input.get("_lastChangedAt").is_none());
    }

    #[test]
    fn test_delete_input_is_key_and_version() {
        let schema = schema();
        let def = schema.model("Post").unwrap();
        let input = mutation_input(&schema, def, MutationOperation::Delete, &record());
        assert_eq!(input, json!({"id": "1", "_version": 3}));
    }

    #[test]
    fn test_documents_select_sync_fields() {
        let schema = schema();
        let ops = ModelOperations::for_model(schema.model("Post").unwrap());
        assert_eq!(ops.create.name, "createPost");
        assert!(ops
            .create
            .document
            .starts_with("mutation CreatePost($input: CreatePostInput!, $condition: ModelPostConditionInput)"));
        assert!(ops.update.document.contains("_lastChangedAt"));
        assert!(ops.get.document.starts_with("query GetPost($id: ID!)"));
        assert!(ops.get.document.contains("blogId"));
    }

    #[test]
    fn test_get_variables() {
        let schema = schema();
        let def = schema.model("Post").unwrap();
        assert_eq!(get_variables(def, &record()), json!({"id": "1"}));
    }
}
