//! Schema definitions
//!
//! A [`Schema`] is the explicit, per-engine description of every model the
//! engine manages. It is built once, validated, and then shared behind an
//! `Arc` by every component. Two engines in the same process can hold two
//! unrelated schemas.
//!
//! ## Relationships
//!
//! | Kind        | Join fields        | Lives on                             |
//! |-------------|--------------------|--------------------------------------|
//! | `BelongsTo` | `target_names`     | this model, holding the parent's key |
//! | `HasOne`    | `associated_with`  | the child, holding this model's key  |
//! | `HasMany`   | `associated_with`  | the children, holding this model's key |
//!
//! Building a schema adds an implicit index for every set of join fields so
//! relationship traversal never needs a full scan.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// Field types
// ============================================================================

/// Scalar field types supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Id,
    String,
    Int,
    Float,
    Boolean,
    DateTime,
    Json,
}

/// Cardinality of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    HasOne,
    HasMany,
    BelongsTo,
}

/// Relationship metadata attached to a relation field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub kind: RelationKind,
    /// Model on the other side of the relation
    pub related_model: String,
    /// `BelongsTo` only: local fields holding the related model's key
    #[serde(default)]
    pub target_names: Vec<String>,
    /// `HasOne`/`HasMany` only: fields on the related model holding this model's key
    #[serde(default)]
    pub associated_with: Vec<String>,
}

impl Relationship {
    pub fn belongs_to(related_model: impl Into<String>, target_names: &[&str]) -> Self {
        Self {
            kind: RelationKind::BelongsTo,
            related_model: related_model.into(),
            target_names: target_names.iter().map(|s| s.to_string()).collect(),
            associated_with: Vec::new(),
        }
    }

    pub fn has_one(related_model: impl Into<String>, associated_with: &[&str]) -> Self {
        Self {
            kind: RelationKind::HasOne,
            related_model: related_model.into(),
            target_names: Vec::new(),
            associated_with: associated_with.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn has_many(related_model: impl Into<String>, associated_with: &[&str]) -> Self {
        Self {
            kind: RelationKind::HasMany,
            related_model: related_model.into(),
            target_names: Vec::new(),
            associated_with: associated_with.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Scalar or relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Scalar(ScalarType),
    Relation(Relationship),
}

/// One field of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub is_array: bool,
    /// Server-managed field, never sent in mutation inputs
    #[serde(default)]
    pub read_only: bool,
}

impl FieldDefinition {
    pub fn scalar(name: impl Into<String>, scalar: ScalarType) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(scalar),
            required: false,
            is_array: false,
            read_only: false,
        }
    }

    pub fn relation(name: impl Into<String>, relationship: Relationship) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Relation(relationship),
            required: false,
            is_array: false,
            read_only: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn relationship(&self) -> Option<&Relationship> {
        match &self.kind {
            FieldKind::Relation(rel) => Some(rel),
            FieldKind::Scalar(_) => None,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.relationship().is_some()
    }
}

/// A named secondary index over one or more scalar fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<String>,
}

// ============================================================================
// ModelDefinition
// ============================================================================

/// Schema for one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Whether local writes are queued for the remote service
    #[serde(default)]
    pub syncable: bool,
    /// Ownership fields populated by the remote service when left null
    #[serde(default)]
    pub owner_fields: Vec<String>,
}

impl ModelDefinition {
    pub fn builder(name: impl Into<String>) -> ModelDefinitionBuilder {
        ModelDefinitionBuilder::new(name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.field(name).and_then(FieldDefinition::relationship)
    }

    /// All relation fields with their metadata
    pub fn relations(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.fields
            .iter()
            .filter_map(|f| f.relationship().map(|rel| (f.name.as_str(), rel)))
    }

    /// Declared scalar fields plus foreign keys implied by `BelongsTo` relations
    pub fn scalar_field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .fields
            .iter()
            .filter(|f| !f.is_relation())
            .map(|f| f.name.clone())
            .collect();
        for (_, rel) in self.relations() {
            if rel.kind == RelationKind::BelongsTo {
                for target in &rel.target_names {
                    if !names.contains(target) {
                        names.push(target.clone());
                    }
                }
            }
        }
        names
    }

    pub fn is_scalar_field(&self, name: &str) -> bool {
        match self.field(name) {
            Some(field) => !field.is_relation(),
            None => self.relations().any(|(_, rel)| {
                rel.kind == RelationKind::BelongsTo && rel.target_names.iter().any(|t| t == name)
            }),
        }
    }

    pub fn is_owner_field(&self, name: &str) -> bool {
        self.owner_fields.iter().any(|f| f == name)
    }

    fn has_index_on(&self, fields: &[String]) -> bool {
        self.indexes.iter().any(|idx| idx.fields == fields)
    }
}

/// Builder for [`ModelDefinition`]
#[derive(Debug, Clone)]
pub struct ModelDefinitionBuilder {
    def: ModelDefinition,
}

impl ModelDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: ModelDefinition {
                name: name.into(),
                fields: Vec::new(),
                primary_key: vec!["id".to_string()],
                indexes: Vec::new(),
                syncable: true,
                owner_fields: Vec::new(),
            },
        }
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.def.fields.push(field);
        self
    }

    pub fn primary_key(mut self, fields: &[&str]) -> Self {
        self.def.primary_key = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn index(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        self.def.indexes.push(IndexDefinition {
            name: name.into(),
            fields: fields.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn syncable(mut self, syncable: bool) -> Self {
        self.def.syncable = syncable;
        self
    }

    pub fn owner_field(mut self, name: impl Into<String>) -> Self {
        self.def.owner_fields.push(name.into());
        self
    }

    pub fn build(self) -> ModelDefinition {
        self.def
    }
}

// ============================================================================
// Schema
// ============================================================================

/// The set of models one engine instance manages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub namespace: String,
    pub version: String,
    pub models: BTreeMap<String, Arc<ModelDefinition>>,
}

impl Schema {
    /// Validates the model set and derives implicit relationship indexes.
    pub fn new(
        namespace: impl Into<String>,
        version: impl Into<String>,
        models: Vec<ModelDefinition>,
    ) -> Result<Self, DomainError> {
        let mut by_name: BTreeMap<String, ModelDefinition> = BTreeMap::new();
        for model in models {
            if by_name.contains_key(&model.name) {
                return Err(DomainError::InvalidSchema(format!(
                    "duplicate model {}",
                    model.name
                )));
            }
            by_name.insert(model.name.clone(), model);
        }

        for model in by_name.values() {
            validate_model(model, &by_name)?;
        }

        // Implicit join indexes
        let mut additions: Vec<(String, Vec<String>)> = Vec::new();
        for model in by_name.values() {
            for (_, rel) in model.relations() {
                match rel.kind {
                    RelationKind::BelongsTo => {
                        additions.push((model.name.clone(), rel.target_names.clone()))
                    }
                    RelationKind::HasOne | RelationKind::HasMany => {
                        additions.push((rel.related_model.clone(), rel.associated_with.clone()))
                    }
                }
            }
        }
        for (model_name, fields) in additions {
            if let Some(model) = by_name.get_mut(&model_name) {
                if !model.has_index_on(&fields) && model.primary_key != fields {
                    model.indexes.push(IndexDefinition {
                        name: format!("by_{}", fields.join("_")),
                        fields,
                    });
                }
            }
        }

        Ok(Self {
            namespace: namespace.into(),
            version: version.into(),
            models: by_name
                .into_iter()
                .map(|(name, def)| (name, Arc::new(def)))
                .collect(),
        })
    }

    pub fn model(&self, name: &str) -> Result<&Arc<ModelDefinition>, DomainError> {
        self.models
            .get(name)
            .ok_or_else(|| DomainError::UnknownModel(name.to_string()))
    }

    pub fn syncable_models(&self) -> impl Iterator<Item = &Arc<ModelDefinition>> {
        self.models.values().filter(|m| m.syncable)
    }
}

fn validate_model(
    model: &ModelDefinition,
    all: &BTreeMap<String, ModelDefinition>,
) -> Result<(), DomainError> {
    if model.primary_key.is_empty() {
        return Err(DomainError::InvalidSchema(format!(
            "model {} has no primary key",
            model.name
        )));
    }
    for key in &model.primary_key {
        if !model.is_scalar_field(key) {
            return Err(DomainError::InvalidSchema(format!(
                "primary key field {} of {} is not a scalar field",
                key, model.name
            )));
        }
    }
    for index in &model.indexes {
        if index.fields.is_empty() || index.fields.iter().any(|f| !model.is_scalar_field(f)) {
            return Err(DomainError::InvalidSchema(format!(
                "index {} of {} must cover scalar fields",
                index.name, model.name
            )));
        }
    }
    for (field, rel) in model.relations() {
        let related = all.get(&rel.related_model).ok_or_else(|| {
            DomainError::InvalidSchema(format!(
                "relation {}.{} targets unknown model {}",
                model.name, field, rel.related_model
            ))
        })?;
        match rel.kind {
            RelationKind::BelongsTo => {
                if rel.target_names.len() != related.primary_key.len() {
                    return Err(DomainError::InvalidSchema(format!(
                        "relation {}.{} needs one target name per key field of {}",
                        model.name, field, related.name
                    )));
                }
            }
            RelationKind::HasOne | RelationKind::HasMany => {
                if rel.associated_with.len() != model.primary_key.len() {
                    return Err(DomainError::InvalidSchema(format!(
                        "relation {}.{} needs one associated field per key field of {}",
                        model.name, field, model.name
                    )));
                }
                if let Some(missing) = rel
                    .associated_with
                    .iter()
                    .find(|f| !related.is_scalar_field(f))
                {
                    return Err(DomainError::InvalidSchema(format!(
                        "relation {}.{} refers to unknown field {}.{}",
                        model.name, field, related.name, missing
                    )));
                }
            }
        }
    }
    Ok(())
}
