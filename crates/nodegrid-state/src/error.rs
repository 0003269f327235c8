//! Error types for the node registry.

use thiserror::Error;

use crate::types::NodeState;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("binding {request} to {node} would exceed allocatable capacity")]
    CapacityExceeded { node: String, request: String },

    #[error("node {node} is {state} and accepts no new bindings")]
    NotSchedulable { node: String, state: NodeState },

    #[error("request {request} is already bound to {node}")]
    AlreadyBound { request: String, node: String },

    #[error("invalid transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: NodeState,
        to: NodeState,
    },

    #[error("conflict on {0}")]
    Conflict(String),

    #[error("node {0} is guarded by its termination finalizer")]
    DeletionGuarded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
