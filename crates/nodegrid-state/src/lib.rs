//! nodegrid-state — the node registry.
//!
//! Backed by [redb](https://docs.rs/redb), the registry is the single
//! source of truth shared by the allocation, consolidation and termination
//! controllers: nodes and their bound requests, the unplaced set,
//! provisioners, disruption budgets, status conditions and leader leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every mutation runs inside one redb write transaction, which makes the
//! read-check-write sequences (`bind`, `transition`, `release_to_pending`)
//! atomic and serializes concurrent writers touching the same node.
//!
//! The `NodeRegistry` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Reads return point-in-time
//! snapshots; callers must re-read after yielding.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use store::NodeRegistry;
pub use types::*;
