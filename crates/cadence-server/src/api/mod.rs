//! API module for the Cadence server
//!
//! Routes, the admission middleware and the error envelope.

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod errors;
pub mod health;
pub mod middleware;
pub mod tasks;

use crate::server::CadenceServer;

/// Build the router for all endpoints
///
/// Every route passes through the admission middleware; exempt paths are
/// decided by the configured policy set, not by the routing.
pub fn build_router(server: Arc<CadenceServer>) -> Router {
    Router::new()
        // Service endpoints
        .route("/", get(health::service_info))
        .route("/health", get(health::health_check))
        // Task API
        .route("/v1/tasks", post(tasks::submit_task).get(tasks::list_tasks))
        .route("/v1/tasks/:id", get(tasks::get_task))
        .route("/v1/tasks/:id/cancel", post(tasks::cancel_task))
        .layer(axum_middleware::from_fn_with_state(Arc::clone(&server), middleware::rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}
