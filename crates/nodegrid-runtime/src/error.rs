//! Controller error taxonomy.
//!
//! Every reconciliation failure maps to one of four classes that decide
//! how the key is requeued. Errors never escape the worker loop.

use thiserror::Error;

use nodegrid_backend::BackendError;
use nodegrid_state::RegistryError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Malformed input reached the controller. Not retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Backend quota or availability failure.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// Network or API hiccup.
    #[error("transient error: {0}")]
    Transient(String),

    /// A concurrent registry update won the race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage failure inside the registry.
    #[error("registry error: {0}")]
    Registry(RegistryError),
}

/// How a failed key is put back on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Re-run on the next queue cycle.
    Immediate,
    /// Re-run after the queue's rate-limited backoff.
    Backoff,
    /// Drop the key; a status condition records the failure.
    Never,
}

impl ControllerError {
    pub fn requeue(&self) -> Requeue {
        match self {
            ControllerError::Conflict(_) => Requeue::Immediate,
            ControllerError::Capacity(_)
            | ControllerError::Transient(_)
            | ControllerError::Registry(_) => Requeue::Backoff,
            ControllerError::Validation(_) => Requeue::Never,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.requeue() != Requeue::Never
    }
}

impl From<RegistryError> for ControllerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { .. }
            | RegistryError::NotSchedulable { .. }
            | RegistryError::AlreadyBound { .. }
            | RegistryError::InvalidTransition { .. }
            | RegistryError::Conflict(_)
            | RegistryError::DeletionGuarded(_)
            | RegistryError::NotFound(_) => ControllerError::Conflict(err.to_string()),
            other => ControllerError::Registry(other),
        }
    }
}

impl From<BackendError> for ControllerError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Capacity(msg) => ControllerError::Capacity(msg),
            BackendError::Transient(msg) | BackendError::NotFound(msg) => {
                ControllerError::Transient(msg)
            }
            BackendError::Invalid(msg) => ControllerError::Validation(msg),
        }
    }
}
