//! Remote service port (driven/secondary port)
//!
//! The engine talks to the remote service only through [`IRemoteApi`]: a
//! GraphQL-style document plus variables goes in, the `data` object or a
//! classified [`RemoteError`] comes out. Transport, signing and retries at the
//! HTTP level belong to the implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `errorType` reported when the caller is not authorized for the auth mode used
pub const ERROR_TYPE_UNAUTHORIZED: &str = "Unauthorized";
/// `errorType` reported when the mutation's `_version` is stale
pub const ERROR_TYPE_CONFLICT_UNHANDLED: &str = "ConflictUnhandled";

/// Authorization mode a request is signed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    ApiKey,
    UserPool,
    Oidc,
    Iam,
    Lambda,
}

/// A single document execution
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub query: String,
    pub variables: Value,
    pub auth_mode: AuthMode,
    pub auth_token: Option<String>,
}

/// One entry of a GraphQL `errors` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlError {
    #[serde(rename = "errorType", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: String,
    /// For conflicts, the record as currently stored remotely
    #[serde(default)]
    pub data: Option<Value>,
}

/// Errors returned by the remote service
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// Transport-level failure; the request may be retried as is
    #[error("Network error: {0}")]
    Network(String),

    /// The service answered with an `errors` array
    #[error("Remote error: {}", .errors.first().map(|e| e.message.as_str()).unwrap_or("unknown"))]
    Response { errors: Vec<GraphQlError> },
}

impl RemoteError {
    /// Shorthand for a single-error response
    pub fn response(error_type: impl Into<String>, message: impl Into<String>, data: Option<Value>) -> Self {
        RemoteError::Response {
            errors: vec![GraphQlError {
                error_type: Some(error_type.into()),
                message: message.into(),
                data,
            }],
        }
    }

    pub fn error_type(&self) -> Option<&str> {
        match self {
            RemoteError::Network(_) => None,
            RemoteError::Response { errors } => {
                errors.first().and_then(|e| e.error_type.as_deref())
            }
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        match self {
            RemoteError::Network(_) => false,
            RemoteError::Response { errors } => errors.iter().any(|e| {
                e.error_type.as_deref() == Some(ERROR_TYPE_UNAUTHORIZED)
                    || e.message.contains("401")
            }),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.error_type() == Some(ERROR_TYPE_CONFLICT_UNHANDLED)
    }

    /// Remote record attached to a conflict response
    pub fn conflict_data(&self) -> Option<&Value> {
        match self {
            RemoteError::Response { errors } if self.is_conflict() => {
                errors.first().and_then(|e| e.data.as_ref())
            }
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            RemoteError::Network(msg) => msg.clone(),
            RemoteError::Response { errors } => errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Port trait for executing remote documents
#[async_trait::async_trait]
pub trait IRemoteApi: Send + Sync {
    /// Executes a document and returns its `data` object
    async fn execute(&self, request: RemoteRequest) -> Result<Value, RemoteError>;
}

/// Port trait for credential acquisition
///
/// Uses `anyhow::Result` because token sources are adapter-specific.
#[async_trait::async_trait]
pub trait IAuthProvider: Send + Sync {
    /// Token for `mode`, `None` when the mode needs no token
    async fn token_for(&self, mode: AuthMode) -> anyhow::Result<Option<String>>;
}
