//! API Types
//!
//! Request/response types for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zephyr::BlockTrace;

use crate::store::{ProofRecord, TaskId, TaskRecord, TaskStatus};

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime_secs: u64,
    pub workers: usize,
    pub idle_workers: usize,
    pub sessions: usize,
}

// ============================================================================
// Tasks
// ============================================================================

/// Request to enqueue a proving task
#[derive(Debug, Serialize, Deserialize)]
pub struct InsertTaskRequest {
    pub traces: Vec<BlockTrace>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsertTaskResponse {
    pub id: TaskId,
}

/// Task status plus its proof, once one is stored
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub id: TaskId,
    pub status: TaskStatus,
    pub block_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_time_sec: Option<u64>,
}

impl TaskResponse {
    pub fn new(task: TaskRecord, proof: Option<ProofRecord>) -> Self {
        Self {
            id: task.id,
            status: task.status,
            block_count: task.block_count,
            created_at: task.created_at,
            updated_at: task.updated_at,
            proof: proof.as_ref().map(|p| hex::encode(&p.proof)),
            proof_time_sec: proof.map(|p| p.proof_time_sec),
        }
    }
}

// ============================================================================
// Error Response
// ============================================================================

/// Standard error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(msg, "BAD_REQUEST")
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(msg, "INTERNAL_ERROR")
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(msg, "NOT_FOUND")
    }
}
