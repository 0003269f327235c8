//! In-flight request claims.
//!
//! A request is claimed for as long as the pass that batched it is
//! launching capacity for it. A second pass that sees the same unplaced
//! request skips it instead of launching duplicate capacity. Claims are
//! released when the guard drops; a claim older than the TTL is treated
//! as abandoned and may be taken over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use nodegrid_core::RequestId;

#[derive(Debug)]
struct Claim {
    owner: u64,
    claimed_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    claims: HashMap<RequestId, Claim>,
    next_owner: u64,
}

/// Shared claim table. Cloning shares the underlying table.
#[derive(Debug, Clone)]
pub struct ClaimTable {
    inner: Arc<Mutex<Inner>>,
    ttl_secs: u64,
}

impl ClaimTable {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            ttl_secs,
        }
    }

    /// Claim every id not already held by a live claim.
    ///
    /// The returned guard owns exactly the ids that were free; ids held by
    /// another pass are left out.
    pub fn claim<'a>(&self, ids: impl IntoIterator<Item = &'a RequestId>, now: u64) -> ClaimGuard {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_owner += 1;
        let owner = inner.next_owner;

        let mut claimed = Vec::new();
        for id in ids {
            let free = match inner.claims.get(id) {
                Some(claim) => now.saturating_sub(claim.claimed_at) >= self.ttl_secs,
                None => true,
            };
            if free {
                inner.claims.insert(
                    id.clone(),
                    Claim {
                        owner,
                        claimed_at: now,
                    },
                );
                claimed.push(id.clone());
            }
        }
        debug!(owner, claimed = claimed.len(), "requests claimed");
        ClaimGuard {
            table: self.clone(),
            owner,
            ids: claimed,
        }
    }

    pub fn is_claimed(&self, id: &str, now: u64) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .claims
            .get(id)
            .is_some_and(|c| now.saturating_sub(c.claimed_at) < self.ttl_secs)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claims
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, owner: u64, ids: &[RequestId]) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            // A takeover after TTL expiry belongs to the new owner.
            if inner.claims.get(id).is_some_and(|c| c.owner == owner) {
                inner.claims.remove(id);
            }
        }
    }
}

/// Releases its claims on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    table: ClaimTable,
    owner: u64,
    ids: Vec<RequestId>,
}

impl ClaimGuard {
    pub fn ids(&self) -> &[RequestId] {
        &self.ids
    }

    pub fn holds(&self, id: &str) -> bool {
        self.ids.iter().any(|i| i == id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.table.release(self.owner, &self.ids);
    }
}
