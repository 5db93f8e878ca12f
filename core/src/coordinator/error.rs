use thiserror::Error;
use zelana_pubkey::Pubkey;

use crate::store::TaskId;

/// Errors surfaced by the registry and session manager.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no proof session for task {0}")]
    NoSuchSession(TaskId),

    #[error("worker {worker} is not assigned to session {task_id}")]
    NotEligible { task_id: TaskId, worker: Pubkey },

    #[error("proof from worker {worker} for session {task_id} is still being processed")]
    ReportInProgress { task_id: TaskId, worker: Pubkey },

    #[error("worker {0} re-registered within the reconnect cooldown")]
    ReconnectTooFrequent(Pubkey),

    #[error("verification of task {task_id} failed: {reason}")]
    VerificationFailed { task_id: TaskId, reason: String },

    #[error("persistence error: {0}")]
    Persistence(anyhow::Error),

    #[error("worker {0} is busy")]
    WorkerBusy(Pubkey),

    #[error("unknown worker {0}")]
    UnknownWorker(Pubkey),
}
