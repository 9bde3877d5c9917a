//! Error types for the orchestrator.

use orbit_core::LockInfo;
use orbit_state::StateError;
use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type DirectorResult<T> = Result<T, DirectorError>;

/// Errors surfaced by the orchestrator to its callers.
#[derive(Debug, Error)]
pub enum DirectorError {
    /// A required field was missing or malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Deployment is locked; carries the lock record for diagnostics.
    #[error("deployment {deployment} is locked by {} for {}", lock.username, lock.lock_for_operation)]
    AlreadyLocked {
        deployment: String,
        lock: Box<LockInfo>,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unprocessable input: {0}")]
    UnprocessableInput(String),

    /// Unexpected failure reported by an external collaborator.
    #[error("{service} failed: {message}")]
    Upstream { service: String, message: String },

    /// The agent does not declare the feature needed.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The deployment has no manifest and cannot be operated on.
    #[error("deployment {0} is not operational")]
    NotOperational(String),

    #[error("invalid deployment name '{name}': expected {expected}")]
    InvalidDeploymentName { name: String, expected: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl DirectorError {
    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn locked(deployment: impl Into<String>, lock: LockInfo) -> Self {
        Self::AlreadyLocked {
            deployment: deployment.into(),
            lock: Box::new(lock),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::State(StateError::NotFound(_)))
    }
}
