//! Status server.
//!
//! A small HTTP listener reporting the outcome of bootstrap.  It is not a
//! data-plane API: clients talk to the consensus store directly.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::cluster::bootstrap::{ClusterState, NodeRole};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::node::NodeStatus;
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the status API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "quorumd status API",
        version = "0.1.0",
        description = "Bootstrap outcome of a consensus cluster node"
    ),
    paths(health_check, node_status),
    components(schemas(NodeStatus, NodeRole, ClusterState)),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Node", description = "Node bootstrap status"),
    )
)]
struct ApiDoc;

/// Build the status [`Router`].
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(node_status))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Handlers -----------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /status` -- How this node bootstrapped.
#[utoipa::path(
    get,
    path = "/status",
    tag = "Node",
    operation_id = "NodeStatus",
    responses(
        (status = 200, description = "Node status", body = NodeStatus)
    )
)]
async fn node_status(State(state): State<Arc<AppState>>) -> Json<NodeStatus> {
    Json(state.status.clone())
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
