//! API Routes
//!
//! Router configuration for the HTTP API.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{self, ApiState};

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        // Introspection
        .route("/debug/workers", get(handlers::list_workers))
        .route("/debug/sessions/{id}", get(handlers::get_session))
        // Tasks
        .route("/debug/tasks", post(handlers::insert_task))
        .route("/debug/tasks/{id}", get(handlers::get_task))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
