//! Session Manager
//!
//! Drives proof generation end to end:
//!
//! ```text
//!   store ──unassigned──▶ dispatch loop ──select idle──▶ registry
//!                              │                            │
//!                              ▼                            ▼ task channel
//!                        SessionStore ◀──submit_proof── connection
//!                              │
//!                              ▼
//!                     collection timer ──▶ Failed / winner
//! ```
//!
//! One long-lived dispatch loop, one collection timer per open session.
//! Proof submissions run inline on the connection task that received them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zelana_config::{ManagerTomlConfig, OrderSession};
use zelana_pubkey::Pubkey;
use zephyr::{ProofMsg, ProofStatus, TaskMsg, WorkerIdentity};

use super::registry::WorkerRegistry;
use super::selection::select_winner;
use super::session::{
    Claim, Completion, FailedSession, Session, SessionInfo, SessionStore, WorkerOutcome,
};
use super::CoordinatorError;
use crate::store::{TaskId, TaskRecord, TaskStatus, TaskStore};
use crate::verifier::ProofVerifier;

const NO_PROOFS_ERROR: &str = "proof generation session ended without receiving any proofs";
const REJECTED_ERROR: &str = "proof rejected by verifier";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub dispatch_interval: Duration,
    pub collection_time: Duration,
    pub order_session: OrderSession,
    pub worker_channel_capacity: usize,
    pub reconnect_cooldown: Duration,
    pub max_failed_sessions: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&ManagerTomlConfig::default())
    }
}

impl From<&ManagerTomlConfig> for ManagerConfig {
    fn from(toml: &ManagerTomlConfig) -> Self {
        Self {
            dispatch_interval: Duration::from_millis(toml.dispatch_interval_ms.max(1)),
            collection_time: Duration::from_secs(toml.collection_time_secs),
            order_session: toml.order_session,
            worker_channel_capacity: toml.worker_channel_capacity,
            reconnect_cooldown: Duration::from_secs(toml.reconnect_cooldown_secs),
            max_failed_sessions: toml.max_failed_sessions,
        }
    }
}

/// Debug view of one registered worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub name: String,
    pub version: String,
    pub public_key: Pubkey,
    pub connected: bool,
    pub registered_at: DateTime<Utc>,
    pub active_session: Option<TaskId>,
    pub active_session_start_time: Option<DateTime<Utc>>,
    pub in_flight: Vec<TaskId>,
    pub dispatched: u64,
    pub completed: u64,
}

// ============================================================================
// Manager
// ============================================================================

pub struct Manager {
    config: ManagerConfig,
    registry: WorkerRegistry,
    sessions: SessionStore,
    store: Arc<dyn TaskStore>,
    verifier: Arc<dyn ProofVerifier>,
    cancel: CancellationToken,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn TaskStore>,
        verifier: Arc<dyn ProofVerifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: WorkerRegistry::new(config.worker_channel_capacity, config.reconnect_cooldown),
            sessions: SessionStore::new(config.max_failed_sessions),
            config,
            store,
            verifier,
            cancel: CancellationToken::new(),
            dispatch_handle: Mutex::new(None),
        })
    }

    /// Recovers tasks orphaned by a previous process, then starts the
    /// dispatch loop.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.recover_assigned()?;

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_dispatch_loop().await });
        *self
            .dispatch_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            interval_ms = self.config.dispatch_interval.as_millis() as u64,
            collection_secs = self.config.collection_time.as_secs(),
            order = %self.config.order_session,
            "session manager started"
        );
        Ok(())
    }

    /// Stops the dispatch loop and every pending collection timer.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.sessions.abort_timers();
        let handle = self
            .dispatch_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }
        info!("session manager stopped");
    }

    /// No session survives a restart, so nothing can own an `Assigned` task.
    fn recover_assigned(&self) -> anyhow::Result<()> {
        let orphaned = self.store.get_tasks_by_status(TaskStatus::Assigned)?;
        for task in &orphaned {
            self.store
                .update_task_status(task.id, TaskStatus::Unassigned)?;
        }
        if !orphaned.is_empty() {
            info!(count = orphaned.len(), "reset orphaned assigned tasks to unassigned");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn run_dispatch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffered: VecDeque<TaskRecord> = VecDeque::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.dispatch_tick(&mut buffered),
            }
        }
        debug!("dispatch loop exited");
    }

    /// One pass: refill the local buffer if empty, then hand out tasks
    /// while idle workers last.
    fn dispatch_tick(self: &Arc<Self>, buffered: &mut VecDeque<TaskRecord>) {
        if buffered.is_empty() {
            let idle = self.registry.idle_count();
            if idle == 0 {
                return;
            }
            match self
                .store
                .get_unassigned_tasks(idle, self.config.order_session)
            {
                Ok(tasks) => buffered.extend(tasks),
                Err(e) => {
                    error!(error = %e, "failed to fetch unassigned tasks");
                    return;
                }
            }
        }

        while let Some(task) = buffered.front() {
            let task_id = task.id;
            if self.sessions.contains(task_id) {
                buffered.pop_front();
                continue;
            }
            match self.start_session(task_id) {
                Ok(true) => {
                    buffered.pop_front();
                }
                Ok(false) => break,
                Err(e) => {
                    error!(task_id, error = %e, "failed to start proof session");
                    buffered.pop_front();
                }
            }
        }
    }

    /// Opens a session for `task_id` on a random idle worker.
    ///
    /// `Ok(false)` when no idle worker could take it; the task stays
    /// unassigned for a later tick.
    pub fn start_session(self: &Arc<Self>, task_id: TaskId) -> Result<bool, CoordinatorError> {
        if self.sessions.contains(task_id) {
            return Ok(true);
        }
        let traces = self
            .store
            .get_task_traces(task_id)
            .map_err(CoordinatorError::Persistence)?;
        let task = TaskMsg { id: task_id, traces };

        let mut tried: Vec<Pubkey> = Vec::new();
        let mut status_written = false;

        loop {
            let Some(worker) = self.registry.select_idle(&tried) else {
                if status_written {
                    self.persist_status(task_id, TaskStatus::Unassigned);
                }
                return Ok(false);
            };
            let name = self.registry.name_of(&worker).unwrap_or_default();

            self.registry.record_dispatch(&worker, task_id);
            let (session, completion_rx) = Session::new(task_id, worker, name.clone());
            if !self.sessions.insert(session) {
                self.registry.release(&worker, task_id);
                return Ok(true);
            }

            if !status_written {
                // Logged on failure; the session goes ahead regardless.
                self.persist_status(task_id, TaskStatus::Assigned);
                status_written = true;
            }

            match self.registry.dispatch(&worker, task.clone()) {
                Ok(()) => {
                    info!(task_id, worker = %name, pubkey = %worker, "proof session started");
                    self.spawn_collector(task_id, completion_rx);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(task_id, worker = %name, error = %e, "task push failed, trying another worker");
                    self.sessions.remove(task_id);
                    self.registry.release(&worker, task_id);
                    tried.push(worker);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------------

    fn spawn_collector(
        self: &Arc<Self>,
        task_id: TaskId,
        mut completion_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        let this = Arc::clone(self);
        let deadline = self.config.collection_time;

        let handle = tokio::spawn(async move {
            let timer = tokio::time::sleep(deadline);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    Some((worker, outcome)) = completion_rx.recv() => {
                        this.sessions.set_outcome(task_id, worker, outcome);
                    }
                }
            }
            this.collect(task_id, completion_rx);
        });
        self.sessions.set_timer(task_id, handle.abort_handle());
    }

    /// Retires a session when its collection timer fires.
    fn collect(&self, task_id: TaskId, mut completion_rx: mpsc::UnboundedReceiver<Completion>) {
        let Some(mut session) = self.sessions.remove(task_id) else {
            return;
        };
        while let Ok((worker, outcome)) = completion_rx.try_recv() {
            session.set_outcome(worker, outcome);
        }

        for worker in session.assigned.keys() {
            if session.is_pending_for(worker) {
                self.registry.record_completion(worker, task_id);
            }
        }

        let valid = session.valid_workers();
        match select_winner(&valid) {
            Some(winner) => {
                info!(
                    task_id,
                    valid = valid.len(),
                    winner = %session.names.get(&winner).map_or("", String::as_str),
                    "proof session collected"
                );
            }
            None if session.has_reports() => {
                // Reporters already wrote the final status.
                debug!(task_id, "proof session closed without a valid proof");
            }
            None => {
                warn!(task_id, workers = ?session.worker_names(), "{}", NO_PROOFS_ERROR);
                self.persist_status(task_id, TaskStatus::Failed);
                self.sessions.record_failure(FailedSession {
                    id: task_id,
                    start_time: session.start_time,
                    finish_time: Utc::now(),
                    worker_names: session.worker_names(),
                    error: NO_PROOFS_ERROR.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Accepts a worker's proof result for a session.
    ///
    /// Errors only for unknown sessions and ineligible workers. Proving and
    /// verification failures are absorbed into the task status. `Ok(false)`
    /// means the proof could not be stored and the task went back to the
    /// queue.
    pub async fn submit_proof(
        &self,
        worker: &Pubkey,
        proof: ProofMsg,
    ) -> Result<bool, CoordinatorError> {
        let task_id = proof.id;
        let claim = self
            .sessions
            .claim_report(task_id, worker)
            .ok_or(CoordinatorError::NoSuchSession(task_id))?;

        let (completion, start_time, names) = match claim {
            Claim::NotEligible => {
                return Err(CoordinatorError::NotEligible {
                    task_id,
                    worker: *worker,
                });
            }
            Claim::Repeat(Some(accepted)) => {
                debug!(task_id, pubkey = %worker, accepted, "duplicate proof submission ignored");
                return Ok(accepted);
            }
            Claim::Repeat(None) => {
                return Err(CoordinatorError::ReportInProgress {
                    task_id,
                    worker: *worker,
                });
            }
            Claim::First {
                completion,
                start_time,
                names,
            } => (completion, start_time, names),
        };

        let (outcome, accepted) = self
            .resolve_proof(task_id, worker, proof, start_time, &names)
            .await;
        self.sessions.record_answer(task_id, worker, accepted);

        if completion.send((*worker, outcome)).is_err() {
            debug!(task_id, "session collected before the outcome arrived");
        }
        self.registry.record_completion(worker, task_id);
        Ok(accepted)
    }

    async fn resolve_proof(
        &self,
        task_id: TaskId,
        worker: &Pubkey,
        proof: ProofMsg,
        start_time: DateTime<Utc>,
        names: &[String],
    ) -> (WorkerOutcome, bool) {
        if proof.status != ProofStatus::Ok {
            let reason = proof
                .error
                .unwrap_or_else(|| "worker reported a proving error".to_string());
            warn!(task_id, pubkey = %worker, error = %reason, "worker failed to generate proof");
            self.persist_status(task_id, TaskStatus::Failed);
            self.record_failure(task_id, start_time, names, reason);
            return (WorkerOutcome::ProofInvalid, true);
        }

        let bytes = match proof.proof {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                warn!(task_id, pubkey = %worker, "proof marked ok but carries no bytes");
                self.persist_status(task_id, TaskStatus::Failed);
                self.record_failure(task_id, start_time, names, "empty proof".to_string());
                return (WorkerOutcome::ProofInvalid, true);
            }
        };

        let proof_time = (Utc::now() - start_time).num_seconds().max(0) as u64;
        if let Err(e) = self.store.update_proof(task_id, &bytes, proof_time) {
            error!(task_id, error = %e, "failed to store proof, requeueing task");
            self.persist_status(task_id, TaskStatus::Unassigned);
            return (WorkerOutcome::ProofInvalid, false);
        }
        self.persist_status(task_id, TaskStatus::Proved);

        let verified = self.verify(task_id, &bytes).await;
        let valid = match &verified {
            Ok(valid) => *valid,
            Err(e) => {
                warn!(task_id, error = %e, "verifier unavailable, treating proof as invalid");
                self.record_failure(task_id, start_time, names, e.to_string());
                false
            }
        };

        if valid {
            info!(task_id, pubkey = %worker, proof_time, "proof verified");
            self.persist_status(task_id, TaskStatus::Verified);
            (WorkerOutcome::ProofValid, true)
        } else {
            warn!(task_id, pubkey = %worker, "proof rejected");
            self.persist_status(task_id, TaskStatus::Failed);
            if verified.is_ok() {
                self.record_failure(task_id, start_time, names, REJECTED_ERROR.to_string());
            }
            (WorkerOutcome::ProofInvalid, true)
        }
    }

    async fn verify(&self, task_id: TaskId, proof: &[u8]) -> Result<bool, CoordinatorError> {
        self.verifier
            .verify(task_id, proof)
            .await
            .map_err(|e| CoordinatorError::VerificationFailed {
                task_id,
                reason: format!("{e:#}"),
            })
    }

    /// Persistence failures are logged and absorbed.
    fn persist_status(&self, task_id: TaskId, status: TaskStatus) {
        if let Err(e) = self.store.update_task_status(task_id, status) {
            let err = CoordinatorError::Persistence(e);
            error!(task_id, %status, error = %err, "failed to update task status");
        }
    }

    fn record_failure(
        &self,
        task_id: TaskId,
        start_time: DateTime<Utc>,
        names: &[String],
        error: String,
    ) {
        self.sessions.record_failure(FailedSession {
            id: task_id,
            start_time,
            finish_time: Utc::now(),
            worker_names: names.to_vec(),
            error,
        });
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    /// Registers a worker, rebuilding its in-flight set from live sessions.
    pub fn register_worker(
        &self,
        identity: WorkerIdentity,
    ) -> Result<mpsc::Receiver<TaskMsg>, CoordinatorError> {
        let in_flight = self.sessions.pending_tasks_of(&identity.public_key);
        self.registry.register(identity, in_flight)
    }

    pub fn idle_worker_count(&self) -> usize {
        self.registry.idle_count()
    }

    /// Idle iff no live session still waits on this worker.
    pub fn is_worker_idle(&self, worker: &Pubkey) -> bool {
        self.sessions.pending_tasks_of(worker).is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, task_id: TaskId) -> bool {
        self.sessions.contains(task_id)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|w| {
                let active = self.sessions.active_session_of(&w.pubkey);
                WorkerInfo {
                    name: w.identity.name,
                    version: w.identity.version,
                    public_key: w.pubkey,
                    connected: w.connected,
                    registered_at: w.registered_at,
                    active_session: active.map(|(id, _)| id),
                    active_session_start_time: active.map(|(_, start)| start),
                    in_flight: w.task_ids,
                    dispatched: w.dispatched,
                    completed: w.completed,
                }
            })
            .collect()
    }

    pub fn get_session_info(&self, task_id: TaskId) -> Option<SessionInfo> {
        self.sessions.info(task_id)
    }
}
