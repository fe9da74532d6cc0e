//! Domain errors for the taskherd orchestration engine.

use thiserror::Error;

use super::models::TaskId;

/// Domain-level errors that can occur while orchestrating background tasks.
///
/// Nothing here is fatal to the engine: callers receive these for the
/// operation they invoked, and internal paths log and continue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Admission cancelled for concurrency key {key}")]
    AdmissionCancelled { key: String },

    #[error("Dispatch failed: {message}")]
    DispatchFailed { message: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Execution backend error: {0}")]
    Backend(String),

    #[error("Notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),

    #[error("Background manager is shut down")]
    ShutDown,
}

impl DomainError {
    /// Whether this error came from a queued admission request being torn down.
    pub fn is_admission_cancelled(&self) -> bool {
        matches!(self, Self::AdmissionCancelled { .. })
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::ValidationFailed(err.to_string())
    }
}
