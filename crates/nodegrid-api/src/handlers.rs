//! REST API handlers.
//!
//! Each handler reads or writes through `NodeRegistry` and returns JSON
//! responses. Admission validation happens upstream; bodies that parse are
//! accepted as-is.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, info};

use nodegrid_core::{Provisioner, WorkloadRequest};
use nodegrid_state::{NodeObject, RegistryError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn registry_error(err: RegistryError) -> axum::response::Response {
    let status = match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Conflict(_) | RegistryError::AlreadyBound { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&err.to_string(), status).into_response()
}

/// Queue an allocation pass for every provisioner.
fn trigger_allocation(state: &ApiState) {
    let Some(queue) = &state.allocation else {
        return;
    };
    match state.registry.list_provisioners() {
        Ok(provisioners) => {
            for provisioner in provisioners {
                queue.add(provisioner.name);
            }
        }
        Err(e) => debug!(error = %e, "allocation trigger skipped"),
    }
}

// ── Requests ───────────────────────────────────────────────────

/// GET /api/v1/requests
pub async fn list_requests(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list_pending() {
        Ok(requests) => ApiResponse::ok(requests).into_response(),
        Err(e) => registry_error(e),
    }
}

/// POST /api/v1/requests
pub async fn submit_request(
    State(state): State<ApiState>,
    Json(mut request): Json<WorkloadRequest>,
) -> impl IntoResponse {
    if request.created_at == 0 {
        request.created_at = state.clock.now();
    }
    match state.registry.enqueue_request(&request) {
        Ok(true) => {
            debug!(request = %request.id, owner = %request.owner, "request submitted");
            trigger_allocation(&state);
            (StatusCode::CREATED, ApiResponse::ok(request)).into_response()
        }
        Ok(false) => error_response("request is already bound", StatusCode::CONFLICT).into_response(),
        Err(e) => registry_error(e),
    }
}

// ── Provisioners ───────────────────────────────────────────────

/// GET /api/v1/provisioners
pub async fn list_provisioners(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list_provisioners() {
        Ok(provisioners) => ApiResponse::ok(provisioners).into_response(),
        Err(e) => registry_error(e),
    }
}

/// PUT /api/v1/provisioners/{name}
pub async fn put_provisioner(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(provisioner): Json<Provisioner>,
) -> impl IntoResponse {
    if provisioner.name != name {
        return error_response(
            &format!("body names provisioner {}, path names {name}", provisioner.name),
            StatusCode::BAD_REQUEST,
        )
        .into_response();
    }
    match state.registry.put_provisioner(&provisioner) {
        Ok(()) => {
            info!(provisioner = %name, "provisioner stored");
            if let Some(queue) = &state.allocation {
                queue.add(name);
            }
            ApiResponse::ok(provisioner).into_response()
        }
        Err(e) => registry_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list(|_| true) {
        Ok(nodes) => {
            let objects: Vec<NodeObject> = nodes.iter().map(NodeObject::from).collect();
            ApiResponse::ok(objects).into_response()
        }
        Err(e) => registry_error(e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.get(&id) {
        Ok(Some(node)) => ApiResponse::ok(NodeObject::from(&node)).into_response(),
        Ok(None) => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => registry_error(e),
    }
}

/// DELETE /api/v1/nodes/{id}
///
/// Records the removal request and starts a drain. The node object stays
/// until the backend confirms the instance is gone.
pub async fn delete_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.request_deletion(&id, state.clock.now()) {
        Ok(node) => {
            if let Some(queue) = &state.termination {
                queue.add(node.id.clone());
            }
            (StatusCode::ACCEPTED, ApiResponse::ok(NodeObject::from(&node))).into_response()
        }
        Err(e) => registry_error(e),
    }
}

// ── Conditions ─────────────────────────────────────────────────

/// GET /api/v1/conditions/{kind}/{name}
pub async fn list_conditions(
    State(state): State<ApiState>,
    Path((kind, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.registry.list_conditions(&kind, &name) {
        Ok(conditions) => ApiResponse::ok(conditions).into_response(),
        Err(e) => registry_error(e),
    }
}
