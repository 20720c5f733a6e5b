//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the prospector orchestrator.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (map to INVALID_ARGUMENT).
    #[error("validation error: {0}")]
    Validation(String),

    /// Row not found (map to NOT_FOUND).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition (map to FAILED_PRECONDITION).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Conditional write lost against a concurrent writer (map to ABORTED).
    #[error("version conflict: {0}")]
    Conflict(String),

    /// The phase executor refused or never acknowledged a dispatch (map to UNAVAILABLE).
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// The external execution system reported the phase as failed.
    #[error("phase failed: {0}")]
    PhaseFailed(String),

    /// Timeout (map to DEADLINE_EXCEEDED).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Wait abandoned by cancellation (map to CANCELLED).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Internal errors (map to INTERNAL).
    #[error("internal error: {0}")]
    Internal(String),

    /// SQLite errors.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wire error code used by the IPC layer.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::Conflict(_) => "ABORTED",
            Error::Dispatch(_) => "UNAVAILABLE",
            Error::PhaseFailed(_) => "FAILED_PRECONDITION",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::Cancelled(_) => "CANCELLED",
            Error::Internal(_) | Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => {
                "INTERNAL"
            }
        }
    }

    /// True for errors that end a pipeline run when raised by a phase.
    pub fn is_phase_error(&self) -> bool {
        matches!(
            self,
            Error::Dispatch(_) | Error::PhaseFailed(_) | Error::Timeout(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    pub fn phase_failed(msg: impl Into<String>) -> Self {
        Self::PhaseFailed(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
