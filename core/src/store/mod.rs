//! Task Store
//!
//! Persistence collaborator for proving tasks and their proofs. The manager
//! only ever mutates a task's status and attaches proofs; task creation
//! belongs to whoever ingests chain data.

pub mod db;
pub mod memory;

pub use db::RocksTaskStore;
pub use memory::MemoryTaskStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zelana_config::OrderSession;
use zephyr::BlockTrace;

/// Task index. Also used as the session id.
pub type TaskId = u64;

/// Persisted proving status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Unassigned,
    Assigned,
    Proved,
    Verified,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Unassigned => "Unassigned",
            TaskStatus::Assigned => "Assigned",
            TaskStatus::Proved => "Proved",
            TaskStatus::Verified => "Verified",
            TaskStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub block_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub task_id: TaskId,
    #[serde(with = "hex::serde")]
    pub proof: Vec<u8>,
    pub proof_time_sec: u64,
    pub stored_at: DateTime<Utc>,
}

/// Decouples the coordinator from the database.
pub trait TaskStore: Send + Sync {
    /// Up to `limit` unassigned tasks, in task-index order.
    fn get_unassigned_tasks(&self, limit: usize, order: OrderSession) -> Result<Vec<TaskRecord>>;

    fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>>;

    /// Fails if the task does not exist.
    fn get_task_traces(&self, id: TaskId) -> Result<Vec<BlockTrace>>;

    fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>>;

    /// Fails if the task does not exist.
    fn update_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()>;

    /// Stores the raw proof for a task. Does not touch its status.
    fn update_proof(&self, id: TaskId, proof: &[u8], proof_time_sec: u64) -> Result<()>;

    fn get_proof(&self, id: TaskId) -> Result<Option<ProofRecord>>;

    /// Adds a new unassigned task and returns its id.
    fn insert_task(&self, traces: Vec<BlockTrace>) -> Result<TaskId>;
}
