//! Session Store
//!
//! Live proof sessions keyed by task id, plus a bounded table of recently
//! failed sessions kept for the debug API. Every mutation happens under a
//! single mutex; nothing here calls into the registry while holding it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use zelana_pubkey::Pubkey;

use crate::store::{TaskId, TaskStatus};

/// Per-worker outcome within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerOutcome {
    Assigned,
    ProofValid,
    ProofInvalid,
}

/// A worker's final outcome, sent on the session's completion channel.
pub type Completion = (Pubkey, WorkerOutcome);

#[derive(Debug)]
pub struct Session {
    pub id: TaskId,
    pub assigned: HashMap<Pubkey, WorkerOutcome>,
    pub names: HashMap<Pubkey, String>,
    pub start_time: DateTime<Utc>,
    /// Workers whose proof has been taken for processing, with the answer
    /// their submission got once processing finished.
    reported: HashMap<Pubkey, Option<bool>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    timer: Option<AbortHandle>,
}

impl Session {
    pub fn new(
        id: TaskId,
        worker: Pubkey,
        name: String,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            assigned: HashMap::from([(worker, WorkerOutcome::Assigned)]),
            names: HashMap::from([(worker, name)]),
            start_time: Utc::now(),
            reported: HashMap::new(),
            completion_tx,
            timer: None,
        };
        (session, completion_rx)
    }

    pub fn set_outcome(&mut self, worker: Pubkey, outcome: WorkerOutcome) {
        if let Some(slot) = self.assigned.get_mut(&worker) {
            *slot = outcome;
        }
    }

    /// Assigned and not yet reported.
    pub fn is_pending_for(&self, worker: &Pubkey) -> bool {
        self.assigned.get(worker) == Some(&WorkerOutcome::Assigned)
            && !self.reported.contains_key(worker)
    }

    pub fn has_reports(&self) -> bool {
        !self.reported.is_empty()
    }

    pub fn valid_workers(&self) -> Vec<Pubkey> {
        let mut valid: Vec<Pubkey> = self
            .assigned
            .iter()
            .filter(|(_, o)| **o == WorkerOutcome::ProofValid)
            .map(|(pk, _)| *pk)
            .collect();
        valid.sort();
        valid
    }

    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.values().cloned().collect();
        names.sort();
        names
    }
}

/// What a submitter learns when claiming its report slot.
#[derive(Debug)]
pub enum Claim {
    /// First report from this worker; process it.
    First {
        completion: mpsc::UnboundedSender<Completion>,
        start_time: DateTime<Utc>,
        names: Vec<String>,
    },
    /// This worker already reported for the session. Carries the answer
    /// the first submission got, `None` while it is still being processed.
    Repeat(Option<bool>),
    /// The worker is not assigned to the session.
    NotEligible,
}

/// A recorded session failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailedSession {
    pub id: TaskId,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub worker_names: Vec<String>,
    pub error: String,
}

/// Debug view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: TaskId,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub assigned_worker_names: Vec<String>,
    pub error: Option<String>,
}

struct FailedTable {
    order: VecDeque<TaskId>,
    entries: HashMap<TaskId, FailedSession>,
    capacity: usize,
}

impl FailedTable {
    fn insert(&mut self, failed: FailedSession) {
        if self.capacity == 0 {
            return;
        }
        let id = failed.id;
        if self.entries.insert(id, failed).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

pub struct SessionStore {
    live: Mutex<HashMap<TaskId, Session>>,
    failed: Mutex<FailedTable>,
}

impl SessionStore {
    pub fn new(max_failed_sessions: usize) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            failed: Mutex::new(FailedTable {
                order: VecDeque::new(),
                entries: HashMap::new(),
                capacity: max_failed_sessions,
            }),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<TaskId, Session>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failed(&self) -> MutexGuard<'_, FailedTable> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a session unless one already exists for the task.
    pub fn insert(&self, session: Session) -> bool {
        let mut live = self.live();
        if live.contains_key(&session.id) {
            return false;
        }
        live.insert(session.id, session);
        true
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.live().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    pub fn remove(&self, id: TaskId) -> Option<Session> {
        self.live().remove(&id)
    }

    pub fn set_timer(&self, id: TaskId, handle: AbortHandle) {
        if let Some(session) = self.live().get_mut(&id) {
            session.timer = Some(handle);
        }
    }

    pub fn set_outcome(&self, id: TaskId, worker: Pubkey, outcome: WorkerOutcome) {
        if let Some(session) = self.live().get_mut(&id) {
            session.set_outcome(worker, outcome);
        }
    }

    /// Marks `worker` as having reported for session `id`.
    ///
    /// `None` if the session is gone.
    pub fn claim_report(&self, id: TaskId, worker: &Pubkey) -> Option<Claim> {
        let mut live = self.live();
        let session = live.get_mut(&id)?;
        if !session.assigned.contains_key(worker) {
            return Some(Claim::NotEligible);
        }
        if let Some(accepted) = session.reported.get(worker) {
            return Some(Claim::Repeat(*accepted));
        }
        session.reported.insert(*worker, None);
        Some(Claim::First {
            completion: session.completion_tx.clone(),
            start_time: session.start_time,
            names: session.worker_names(),
        })
    }

    /// Stores the answer given to `worker`'s first submission, so repeats
    /// get the same one.
    pub fn record_answer(&self, id: TaskId, worker: &Pubkey, accepted: bool) {
        if let Some(slot) = self
            .live()
            .get_mut(&id)
            .and_then(|s| s.reported.get_mut(worker))
        {
            *slot = Some(accepted);
        }
    }

    /// Task ids where `worker` is still expected to report.
    pub fn pending_tasks_of(&self, worker: &Pubkey) -> HashSet<TaskId> {
        self.live()
            .values()
            .filter(|s| s.is_pending_for(worker))
            .map(|s| s.id)
            .collect()
    }

    /// The oldest session `worker` still owes a proof for.
    pub fn active_session_of(&self, worker: &Pubkey) -> Option<(TaskId, DateTime<Utc>)> {
        self.live()
            .values()
            .filter(|s| s.is_pending_for(worker))
            .map(|s| (s.id, s.start_time))
            .min_by_key(|(id, start)| (*start, *id))
    }

    pub fn abort_timers(&self) {
        for session in self.live().values_mut() {
            if let Some(timer) = session.timer.take() {
                timer.abort();
            }
        }
    }

    pub fn record_failure(&self, failed: FailedSession) {
        self.failed().insert(failed);
    }

    pub fn failed_session(&self, id: TaskId) -> Option<FailedSession> {
        self.failed().entries.get(&id).cloned()
    }

    /// Failed table first, then the live session.
    pub fn info(&self, id: TaskId) -> Option<SessionInfo> {
        if let Some(failed) = self.failed_session(id) {
            return Some(SessionInfo {
                id,
                status: TaskStatus::Failed.to_string(),
                start_time: failed.start_time,
                finish_time: Some(failed.finish_time),
                assigned_worker_names: failed.worker_names,
                error: Some(failed.error),
            });
        }
        self.live().get(&id).map(|s| SessionInfo {
            id,
            status: TaskStatus::Assigned.to_string(),
            start_time: s.start_time,
            finish_time: None,
            assigned_worker_names: s.worker_names(),
            error: None,
        })
    }
}
