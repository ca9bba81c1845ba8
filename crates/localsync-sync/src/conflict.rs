//! Conflict and error handler hooks for the mutation processor

use async_trait::async_trait;
use tracing::error;

use localsync_core::domain::{ModelInstance, MutationOperation, VERSION_FIELD};

/// A version conflict reported by the remote service
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictData {
    /// The record as queued locally
    pub local: ModelInstance,
    /// The remote's current record
    pub remote: ModelInstance,
    pub operation: MutationOperation,
    /// 1-based count of conflict responses for this mutation
    pub attempt: u32,
}

/// Outcome of a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Send this record instead
    Retry(ModelInstance),
    /// Drop the local mutation and accept the remote record
    Discard,
}

#[async_trait]
pub trait ConflictHandler: Send + Sync {
    async fn on_conflict(&self, conflict: &ConflictData) -> ConflictResolution;
}

/// Replays the local field values on top of the remote `_version`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictHandler;

#[async_trait]
impl ConflictHandler for DefaultConflictHandler {
    async fn on_conflict(&self, conflict: &ConflictData) -> ConflictResolution {
        let version = conflict.remote.get(VERSION_FIELD).clone();
        ConflictResolution::Retry(conflict.local.clone().with(VERSION_FIELD, version))
    }
}

/// A mutation the remote rejected terminally; it has been dropped
#[derive(Debug, Clone, PartialEq)]
pub struct MutationErrorReport {
    pub model: String,
    pub operation: MutationOperation,
    pub record: ModelInstance,
    pub error_type: Option<String>,
    pub message: String,
}

/// Receives terminal mutation failures; must not fail itself
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, report: &MutationErrorReport);
}

/// Logs terminal mutation failures
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, report: &MutationErrorReport) {
        error!(
            model = %report.model,
            operation = %report.operation,
            error_type = report.error_type.as_deref().unwrap_or("unknown"),
            message = %report.message,
            "Mutation rejected by remote; discarded"
        );
    }
}
