//! Backend error taxonomy.

use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by a capacity backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Quota or availability failure for the requested shape/zone.
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    /// Network or API hiccup; the same call may succeed later.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The request can never succeed (unknown shape, zone not offered).
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("instance not found: {0}")]
    NotFound(String),
}
