//! Domain entities and business logic
//!
//! This module contains the core domain types for localsync:
//! - Schema definitions (models, fields, relationships, indexes)
//! - Dynamically typed record values and their total ordering
//! - Model instances and the mutation events queued for them
//! - Per-model sync bookkeeping
//! - Domain-specific error types

pub mod errors;
pub mod instance;
pub mod mutation;
pub mod schema;
pub mod value;

// Re-export commonly used types
pub use errors::DomainError;
pub use instance::{ModelInstance, OpType, DELETED_FIELD, LAST_CHANGED_AT_FIELD, VERSION_FIELD};
pub use mutation::{ModelMetadata, MutationEvent, MutationOperation};
pub use schema::{
    FieldDefinition, FieldKind, IndexDefinition, ModelDefinition, ModelDefinitionBuilder,
    RelationKind, Relationship, ScalarType, Schema,
};
