//! Error types for scheduler operations.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad argument: non-positive resources, empty fields, malformed values.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Request exceeds the global budget, or a finite pool is exhausted.
    #[error("resource capacity exceeded: {0}")]
    ResourceCapacity(String),
    /// Unknown task identifier.
    #[error("task not found: {0}")]
    NotFound(Uuid),
    /// Identifier already set, or a conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Caller claims do not allow the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Action violates the rules of its kind.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// No unique main service in a composition.
    #[error("ambiguity: {0}")]
    Ambiguity(String),
    /// Store file is already opened by someone else.
    #[error("store already in use: {}", .0.display())]
    InUse(PathBuf),
    /// Orchestrator or other internal failure.
    #[error("internal error: {0}")]
    Internal(String),
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error kinds, independent of the payload carried by each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SchedulerError::InvalidArgument`].
    InvalidArgument,
    /// See [`SchedulerError::ResourceCapacity`].
    ResourceCapacity,
    /// See [`SchedulerError::NotFound`].
    NotFound,
    /// See [`SchedulerError::Conflict`].
    Conflict,
    /// See [`SchedulerError::Unauthorized`].
    Unauthorized,
    /// See [`SchedulerError::Validation`].
    Validation,
    /// See [`SchedulerError::Ambiguity`].
    Ambiguity,
    /// See [`SchedulerError::InUse`].
    InUse,
    /// I/O, serialization and orchestrator failures.
    Internal,
}

impl SchedulerError {
    /// Kind of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ResourceCapacity(_) => ErrorKind::ResourceCapacity,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Ambiguity(_) => ErrorKind::Ambiguity,
            Self::InUse(_) => ErrorKind::InUse,
            Self::Internal(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status code surfaced by the schedules API.
    pub const fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidArgument
            | ErrorKind::ResourceCapacity
            | ErrorKind::Validation
            | ErrorKind::Ambiguity => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InUse | ErrorKind::Internal => 500,
        }
    }

    /// Individual messages, one per violation for validation errors.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Self::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
