//! NodeRegistry — redb-backed registry shared by every controller.
//!
//! Each mutating operation opens a single write transaction, reads the
//! current record, checks its preconditions and writes the result back.
//! redb admits one writer at a time, so no two controllers can interleave
//! updates to the same node's bound set.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use nodegrid_core::{DisruptionBudget, OwnerRef, Provisioner, WorkloadRequest};

use crate::error::{RegistryError, RegistryResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `RegistryError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| RegistryError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> RegistryResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RegistryResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> RegistryResult<Option<T>> {
    table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| decode(guard.value()))
        .transpose()
}

fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> RegistryResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn budget_key(owner: &OwnerRef) -> String {
    format!("{}/{}", owner.kind, owner.name)
}

/// Thread-safe node registry backed by redb.
#[derive(Clone)]
pub struct NodeRegistry {
    db: Arc<Database>,
}

impl NodeRegistry {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_tables()?;
        debug!(?path, "node registry opened");
        Ok(registry)
    }

    /// Create an ephemeral in-memory registry.
    pub fn open_in_memory() -> RegistryResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let registry = Self { db: Arc::new(db) };
        registry.ensure_tables()?;
        debug!("in-memory node registry opened");
        Ok(registry)
    }

    fn ensure_tables(&self) -> RegistryResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        txn.open_table(PENDING).map_err(map_err!(Table))?;
        txn.open_table(PROVISIONERS).map_err(map_err!(Table))?;
        txn.open_table(BUDGETS).map_err(map_err!(Table))?;
        txn.open_table(CONDITIONS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert a new node or update an existing node's metadata.
    ///
    /// For an existing node the caller's `generation` must match the stored
    /// one. The bound set and lifecycle state are owned by `bind`/`unbind`
    /// and `transition` and are never overwritten here. New nodes receive
    /// the termination finalizer.
    pub fn upsert(&self, node: &Node) -> RegistryResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut next = node.clone();
            match load::<Node>(&table, &node.id)? {
                Some(existing) => {
                    if existing.generation != node.generation {
                        return Err(RegistryError::Conflict(format!(
                            "node {} generation {} != stored {}",
                            node.id, node.generation, existing.generation
                        )));
                    }
                    next.bound = existing.bound;
                    next.state = existing.state;
                    next.empty_since = existing.empty_since;
                    next.finalizers = existing.finalizers;
                }
                None => {
                    if !next
                        .finalizers
                        .iter()
                        .any(|f| f == TERMINATION_FINALIZER)
                    {
                        next.finalizers.push(TERMINATION_FINALIZER.to_string());
                    }
                    if next.bound.is_empty() && next.empty_since.is_none() {
                        next.empty_since = Some(next.launched_at);
                    }
                }
            }
            next.generation += 1;
            table
                .insert(next.id.as_str(), encode(&next)?.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %stored.id, generation = stored.generation, "node stored");
        Ok(stored)
    }

    /// Get a node snapshot by ID.
    pub fn get(&self, id: &str) -> RegistryResult<Option<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        load(&table, id)
    }

    /// List node snapshots matching a predicate.
    pub fn list(&self, predicate: impl Fn(&Node) -> bool) -> RegistryResult<Vec<Node>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        let mut nodes: Vec<Node> = scan(&table)?;
        nodes.retain(|n| predicate(n));
        Ok(nodes)
    }

    /// Bind a request to a node.
    ///
    /// Fails with `CapacityExceeded` if the node's bound sum would exceed
    /// its allocatable vector, `NotSchedulable` unless the node is Pending
    /// or Ready, and `AlreadyBound` if the request is bound elsewhere.
    /// Binding a request to the node that already holds it is a no-op.
    /// On success the request leaves the unplaced set.
    pub fn bind(&self, node_id: &str, request: &WorkloadRequest) -> RegistryResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut bindings = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;

            let mut node: Node = load(&nodes, node_id)?
                .ok_or_else(|| RegistryError::NotFound(format!("node {node_id}")))?;

            let holder = bindings
                .get(request.id.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value().to_string());
            match holder {
                Some(holder) if holder == node_id => return Ok(node),
                Some(holder) => {
                    return Err(RegistryError::AlreadyBound {
                        request: request.id.clone(),
                        node: holder,
                    });
                }
                None => {}
            }

            if !node.state.is_schedulable() {
                return Err(RegistryError::NotSchedulable {
                    node: node.id.clone(),
                    state: node.state,
                });
            }
            let total = node.requested().add(&request.resources);
            if !total.fits_within(&node.allocatable) {
                return Err(RegistryError::CapacityExceeded {
                    node: node.id.clone(),
                    request: request.id.clone(),
                });
            }

            node.bound.insert(request.id.clone(), request.clone());
            node.empty_since = None;
            node.generation += 1;
            nodes
                .insert(node.id.as_str(), encode(&node)?.as_slice())
                .map_err(map_err!(Write))?;
            bindings
                .insert(request.id.as_str(), node.id.as_str())
                .map_err(map_err!(Write))?;
            pending
                .remove(request.id.as_str())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node_id, request = %request.id, "request bound");
        Ok(node)
    }

    /// Unbind a request from a node. Returns the request if it was bound there.
    pub fn unbind(
        &self,
        node_id: &str,
        request_id: &str,
        now: u64,
    ) -> RegistryResult<Option<WorkloadRequest>> {
        self.unbind_inner(node_id, request_id, now, false)
    }

    /// Atomically unbind a request and return it to the unplaced set.
    pub fn release_to_pending(
        &self,
        node_id: &str,
        request_id: &str,
        now: u64,
    ) -> RegistryResult<Option<WorkloadRequest>> {
        self.unbind_inner(node_id, request_id, now, true)
    }

    fn unbind_inner(
        &self,
        node_id: &str,
        request_id: &str,
        now: u64,
        requeue: bool,
    ) -> RegistryResult<Option<WorkloadRequest>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut bindings = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;

            let Some(mut node) = load::<Node>(&nodes, node_id)? else {
                return Ok(None);
            };
            let Some(request) = node.bound.remove(request_id) else {
                return Ok(None);
            };
            if node.bound.is_empty() {
                node.empty_since = Some(now);
            }
            node.generation += 1;
            nodes
                .insert(node.id.as_str(), encode(&node)?.as_slice())
                .map_err(map_err!(Write))?;
            bindings.remove(request_id).map_err(map_err!(Write))?;
            if requeue {
                pending
                    .insert(request_id, encode(&request)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
            request
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(node = %node_id, request = %request_id, requeue, "request unbound");
        Ok(Some(removed))
    }

    /// Compare-and-set a node's lifecycle state.
    ///
    /// Fails with `Conflict` if the stored state is not `expected`, and
    /// with `InvalidTransition` if `next` is not ahead of `expected`.
    pub fn transition(
        &self,
        id: &str,
        expected: NodeState,
        next: NodeState,
        now: u64,
    ) -> RegistryResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: Node = load(&nodes, id)?
                .ok_or_else(|| RegistryError::NotFound(format!("node {id}")))?;
            if node.state != expected {
                return Err(RegistryError::Conflict(format!(
                    "node {id} is {} (expected {expected})",
                    node.state
                )));
            }
            if !expected.can_transition_to(next) {
                return Err(RegistryError::InvalidTransition {
                    node: id.to_string(),
                    from: expected,
                    to: next,
                });
            }
            node.state = next;
            match next {
                NodeState::Ready => node.ready_at = Some(now),
                NodeState::Draining => node.drain_started_at = Some(now),
                NodeState::Terminated => node.finalizers.retain(|f| f != TERMINATION_FINALIZER),
                _ => {}
            }
            node.generation += 1;
            nodes
                .insert(node.id.as_str(), encode(&node)?.as_slice())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(node = %id, from = %expected, to = %next, "node transitioned");
        Ok(node)
    }

    /// Retire a node's registry entry.
    ///
    /// Only a Terminated node (finalizer released) may be removed. Any
    /// requests still bound are returned to the unplaced set. Returns false
    /// if the node did not exist.
    pub fn remove(&self, id: &str) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut bindings = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;

            let Some(node) = load::<Node>(&nodes, id)? else {
                return Ok(false);
            };
            if node.state != NodeState::Terminated || !node.finalizers.is_empty() {
                return Err(RegistryError::DeletionGuarded(id.to_string()));
            }
            for (request_id, request) in &node.bound {
                bindings
                    .remove(request_id.as_str())
                    .map_err(map_err!(Write))?;
                pending
                    .insert(request_id.as_str(), encode(request)?.as_slice())
                    .map_err(map_err!(Write))?;
            }
            nodes.remove(id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(node = %id, "node removed");
        Ok(true)
    }

    /// Record an external removal request. A Pending or Ready node starts
    /// draining; later states are left alone.
    pub fn request_deletion(&self, id: &str, now: u64) -> RegistryResult<Node> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: Node = load(&nodes, id)?
                .ok_or_else(|| RegistryError::NotFound(format!("node {id}")))?;
            node.deletion_requested = true;
            if node.state.is_schedulable() {
                node.state = NodeState::Draining;
                node.drain_started_at = Some(now);
            }
            node.generation += 1;
            nodes
                .insert(node.id.as_str(), encode(&node)?.as_slice())
                .map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(node = %id, state = %node.state, "deletion requested");
        Ok(node)
    }

    /// Stamp a failed removal attempt, used by the consolidation cool-down.
    pub fn record_removal_failure(&self, id: &str, now: u64) -> RegistryResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let Some(mut node) = load::<Node>(&nodes, id)? else {
                return Ok(());
            };
            node.removal_failed_at = Some(now);
            node.generation += 1;
            nodes
                .insert(node.id.as_str(), encode(&node)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Unplaced requests ──────────────────────────────────────────

    /// Add a request to the unplaced set. Returns false if it is already
    /// bound to a node.
    pub fn enqueue_request(&self, request: &WorkloadRequest) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let bindings = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
            if bindings
                .get(request.id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Ok(false);
            }
            let mut pending = txn.open_table(PENDING).map_err(map_err!(Table))?;
            pending
                .insert(request.id.as_str(), encode(request)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request = %request.id, "request enqueued");
        Ok(true)
    }

    /// List unplaced requests in id order.
    pub fn list_pending(&self) -> RegistryResult<Vec<WorkloadRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING).map_err(map_err!(Table))?;
        scan(&table)
    }

    pub fn get_pending(&self, request_id: &str) -> RegistryResult<Option<WorkloadRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING).map_err(map_err!(Table))?;
        load(&table, request_id)
    }

    /// Drop a request from the unplaced set. Returns true if it existed.
    pub fn delete_pending(&self, request_id: &str) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PENDING).map_err(map_err!(Table))?;
            existed = table.remove(request_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// The node a request is bound to, if any.
    pub fn binding_of(&self, request_id: &str) -> RegistryResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        Ok(table
            .get(request_id)
            .map_err(map_err!(Read))?
            .map(|g| g.value().to_string()))
    }

    // ── Provisioners ───────────────────────────────────────────────

    pub fn put_provisioner(&self, provisioner: &Provisioner) -> RegistryResult<()> {
        self.put(PROVISIONERS, &provisioner.name, provisioner)?;
        debug!(provisioner = %provisioner.name, "provisioner stored");
        Ok(())
    }

    pub fn get_provisioner(&self, name: &str) -> RegistryResult<Option<Provisioner>> {
        self.get_value(PROVISIONERS, name)
    }

    /// List provisioners in name order.
    pub fn list_provisioners(&self) -> RegistryResult<Vec<Provisioner>> {
        self.list_values(PROVISIONERS)
    }

    pub fn delete_provisioner(&self, name: &str) -> RegistryResult<bool> {
        self.delete_value(PROVISIONERS, name)
    }

    // ── Disruption budgets ─────────────────────────────────────────

    pub fn put_budget(&self, budget: &DisruptionBudget) -> RegistryResult<()> {
        self.put(BUDGETS, &budget_key(&budget.owner), budget)
    }

    pub fn get_budget(&self, owner: &OwnerRef) -> RegistryResult<Option<DisruptionBudget>> {
        self.get_value(BUDGETS, &budget_key(owner))
    }

    pub fn list_budgets(&self) -> RegistryResult<Vec<DisruptionBudget>> {
        self.list_values(BUDGETS)
    }

    // ── Conditions ─────────────────────────────────────────────────

    /// Store a condition. If the same condition already holds with the same
    /// status its original transition time is kept.
    pub fn set_condition(&self, condition: &Condition) -> RegistryResult<()> {
        let key = condition.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONDITIONS).map_err(map_err!(Table))?;
            let mut next = condition.clone();
            if let Some(existing) = load::<Condition>(&table, &key)? {
                if existing.status == next.status {
                    next.last_transition = existing.last_transition;
                }
            }
            table
                .insert(key.as_str(), encode(&next)?.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, reason = %condition.reason, "condition set");
        Ok(())
    }

    /// Conditions recorded for one object.
    pub fn list_conditions(&self, kind: &str, name: &str) -> RegistryResult<Vec<Condition>> {
        let prefix = format!("{kind}/{name}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONDITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    pub fn clear_condition(&self, kind: &str, name: &str, type_: &str) -> RegistryResult<bool> {
        self.delete_value(CONDITIONS, &format!("{kind}/{name}/{type_}"))
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Acquire or renew a lease. Succeeds if the lease is free, expired, or
    /// already held by `holder`.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_secs: u64,
        now: u64,
    ) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current = load::<Lease>(&table, name)?;
            let acquired_at = match &current {
                Some(lease) if lease.holder == holder => Some(lease.acquired_at),
                Some(lease) if lease.expires_at > now => None,
                _ => Some(now),
            };
            match acquired_at {
                Some(acquired_at) => {
                    let lease = Lease {
                        name: name.to_string(),
                        holder: holder.to_string(),
                        acquired_at,
                        expires_at: now + ttl_secs,
                    };
                    table
                        .insert(name, encode(&lease)?.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                None => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(acquired)
    }

    /// Release a lease if `holder` owns it.
    pub fn release_lease(&self, name: &str, holder: &str) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match load::<Lease>(&table, name)? {
                Some(lease) if lease.holder == holder => {
                    table.remove(name).map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }

    pub fn get_lease(&self, name: &str) -> RegistryResult<Option<Lease>> {
        self.get_value(LEASES, name)
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        def: redb::TableDefinition<'_, &'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> RegistryResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_value<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<'_, &'static str, &'static [u8]>,
        key: &str,
    ) -> RegistryResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        load(&table, key)
    }

    fn list_values<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<'_, &'static str, &'static [u8]>,
    ) -> RegistryResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan(&table)
    }

    fn delete_value(
        &self,
        def: redb::TableDefinition<'_, &'static str, &'static [u8]>,
        key: &str,
    ) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
