//! Domain error types
//!
//! Validation failures raised while building schemas, predicates and
//! instances. These are always synchronous and fatal for the call that
//! produced them.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The model name is not part of the schema
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// The field is not declared on the model
    #[error("Unknown field {field} on model {model}")]
    UnknownField {
        /// Model the lookup was made against
        model: String,
        /// The offending field name
        field: String,
    },

    /// The predicate is structurally invalid or misused
    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    /// Schema definition is inconsistent
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// A primary key field is absent or null
    #[error("Missing primary key field {field} on model {model}")]
    MissingPrimaryKey {
        /// Model being validated
        model: String,
        /// Key field that has no value
        field: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::UnknownModel("Comment".to_string());
        assert_eq!(err.to_string(), "Unknown model: Comment");

        let err = DomainError::UnknownField {
            model: "Post".to_string(),
            field: "rating".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown field rating on model Post");

        let err = DomainError::MissingPrimaryKey {
            model: "Post".to_string(),
            field: "id".to_string(),
        };
        assert_eq!(err.to_string(), "Missing primary key field id on model Post");
    }

    #[test]
    fn test_error_equality() {
        let a = DomainError::InvalidPredicate("x".into());
        let b = DomainError::InvalidPredicate("x".into());
        assert_eq!(a, b);
        assert_ne!(a, DomainError::ValidationFailed("x".into()));
    }
}
