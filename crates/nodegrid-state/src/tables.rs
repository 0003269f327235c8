//! redb table definitions for the node registry.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Request bindings keyed by `{request_id}`, value is the node id.
pub const BINDINGS: TableDefinition<&str, &str> = TableDefinition::new("bindings");

/// Unplaced workload requests keyed by `{request_id}`.
pub const PENDING: TableDefinition<&str, &[u8]> = TableDefinition::new("pending");

/// Provisioners keyed by `{name}`.
pub const PROVISIONERS: TableDefinition<&str, &[u8]> = TableDefinition::new("provisioners");

/// Disruption budgets keyed by `{owner_kind}/{owner_name}`.
pub const BUDGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("budgets");

/// Status conditions keyed by `{kind}/{name}/{type}`.
pub const CONDITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("conditions");

/// Leader leases keyed by `{lease_name}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
