//! nodegrid-api — orchestrator-facing REST surface.
//!
//! The orchestrator submits requests it could not place and reads back
//! node objects. Node deletion goes through the termination finalizer:
//! `DELETE` only records the request and starts a drain.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/requests` | List unplaced requests |
//! | POST | `/api/v1/requests` | Submit an unplaced request |
//! | GET | `/api/v1/provisioners` | List provisioners |
//! | PUT | `/api/v1/provisioners/{name}` | Create or replace a provisioner |
//! | GET | `/api/v1/nodes` | List node objects |
//! | GET | `/api/v1/nodes/{id}` | Get a node object |
//! | DELETE | `/api/v1/nodes/{id}` | Request node removal |
//! | GET | `/api/v1/conditions/{kind}/{name}` | Status conditions of an object |

pub mod handlers;

use axum::Router;
use axum::routing::{get, put};

use nodegrid_core::NodeId;
use nodegrid_runtime::{Clock, WorkQueue};
use nodegrid_state::NodeRegistry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: NodeRegistry,
    pub clock: Clock,
    /// Poked when requests or provisioners change.
    pub allocation: Option<WorkQueue<String>>,
    /// Poked when a node removal is requested.
    pub termination: Option<WorkQueue<NodeId>>,
}

impl ApiState {
    /// State without controller queues; changes are picked up on resync.
    pub fn new(registry: NodeRegistry, clock: Clock) -> Self {
        Self {
            registry,
            clock,
            allocation: None,
            termination: None,
        }
    }

    pub fn with_queues(mut self, allocation: WorkQueue<String>, termination: WorkQueue<NodeId>) -> Self {
        self.allocation = Some(allocation);
        self.termination = Some(termination);
        self
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/requests", get(handlers::list_requests).post(handlers::submit_request))
        .route("/provisioners", get(handlers::list_provisioners))
        .route("/provisioners/{name}", put(handlers::put_provisioner))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node).delete(handlers::delete_node))
        .route("/conditions/{kind}/{name}", get(handlers::list_conditions))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
