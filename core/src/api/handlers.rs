//! API Handlers
//!
//! Request handlers for the HTTP API.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, info};

use super::types::*;
use crate::coordinator::Manager;
use crate::store::TaskId;

// ============================================================================
// Shared State
// ============================================================================

/// Shared application state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<Manager>,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health check endpoint
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        workers: state.manager.worker_count(),
        idle_workers: state.manager.idle_worker_count(),
        sessions: state.manager.session_count(),
    })
}

// ============================================================================
// Introspection
// ============================================================================

pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.manager.list_workers())
}

pub async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<TaskId>,
) -> impl IntoResponse {
    match state.manager.get_session_info(id) {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::not_found(format!("session {id} not found"))),
        )
            .into_response(),
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Enqueue a task for proving
pub async fn insert_task(
    State(state): State<ApiState>,
    Json(req): Json<InsertTaskRequest>,
) -> impl IntoResponse {
    if req.traces.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::bad_request("task needs at least one block trace")),
        )
            .into_response();
    }

    let blocks = req.traces.len();
    match state.manager.store().insert_task(req.traces) {
        Ok(id) => {
            info!(task_id = id, blocks, "task enqueued");
            (StatusCode::CREATED, Json(InsertTaskResponse { id })).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to insert task");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal(e.to_string())),
            )
                .into_response()
        }
    }
}

pub async fn get_task(State(state): State<ApiState>, Path(id): Path<TaskId>) -> impl IntoResponse {
    let store = state.manager.store();
    let task = match store.get_task(id) {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::not_found(format!("task {id} not found"))),
            )
                .into_response();
        }
        Err(e) => {
            error!(task_id = id, error = %e, "failed to read task");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::internal(e.to_string())),
            )
                .into_response();
        }
    };

    // A missing proof is not an error for a task still in flight.
    let proof = store.get_proof(id).unwrap_or_else(|e| {
        error!(task_id = id, error = %e, "failed to read proof");
        None
    });
    Json(TaskResponse::new(task, proof)).into_response()
}
