//! Error taxonomy shared by every layer of the event store.

use std::time::Duration;

use thiserror::Error;

/// Boxed error used as the `source` of internal failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used across the event store.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Caller-facing event store error.
///
/// - **Validation**: rejected before any store I/O (malformed version, empty field,
///   empty batch, search query without groups).
/// - **Conflict**: a sequence race that survived every retry.
/// - **AlreadyExists**: a unique constraint `Add` collided; carries the message the
///   command declared for that constraint.
/// - **Internal**: anything else (connection loss, unattributed violation, mapping
///   failure, serialization failure).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The configured push timeout elapsed; the in-flight transaction was rolled back.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Rolling back after `source` failed as well.
    #[error("{source} (rollback failed: {rollback})")]
    RollbackFailed {
        #[source]
        source: Box<EventStoreError>,
        rollback: String,
    },
}

impl EventStoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            source: None,
        }
    }

    pub fn internal_with<E>(msg: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Internal {
            message: msg.into(),
            source: Some(source.into()),
        }
    }

    /// The error that caused a failed rollback, or `self` otherwise.
    pub fn root(&self) -> &EventStoreError {
        match self {
            Self::RollbackFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root(), Self::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Self::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Self::AlreadyExists(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.root(), Self::Internal { .. })
    }
}
