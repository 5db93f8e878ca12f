use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use chrono::Utc;
use zelana_config::OrderSession;
use zephyr::BlockTrace;

use super::{ProofRecord, TaskId, TaskRecord, TaskStatus, TaskStore};

#[derive(Default)]
struct Tables {
    tasks: BTreeMap<TaskId, (TaskRecord, Vec<BlockTrace>)>,
    proofs: BTreeMap<TaskId, ProofRecord>,
}

/// In-memory store for tests and `in_memory = true` deployments.
#[derive(Default)]
pub struct MemoryTaskStore {
    tables: Mutex<Tables>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskStore for MemoryTaskStore {
    fn get_unassigned_tasks(&self, limit: usize, order: OrderSession) -> Result<Vec<TaskRecord>> {
        let tables = self.lock();
        let unassigned = |(rec, _): &&(TaskRecord, Vec<BlockTrace>)| {
            rec.status == TaskStatus::Unassigned
        };
        let picked: Vec<TaskRecord> = match order {
            OrderSession::Asc => tables
                .tasks
                .values()
                .filter(unassigned)
                .take(limit)
                .map(|(rec, _)| rec.clone())
                .collect(),
            OrderSession::Desc => tables
                .tasks
                .values()
                .rev()
                .filter(unassigned)
                .take(limit)
                .map(|(rec, _)| rec.clone())
                .collect(),
        };
        Ok(picked)
    }

    fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|(rec, _)| rec.status == status)
            .map(|(rec, _)| rec.clone())
            .collect())
    }

    fn get_task_traces(&self, id: TaskId) -> Result<Vec<BlockTrace>> {
        self.lock()
            .tasks
            .get(&id)
            .map(|(_, traces)| traces.clone())
            .ok_or_else(|| anyhow!("task {id} not found"))
    }

    fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.lock().tasks.get(&id).map(|(rec, _)| rec.clone()))
    }

    fn update_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let mut tables = self.lock();
        let (rec, _) = tables
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        rec.status = status;
        rec.updated_at = Utc::now();
        Ok(())
    }

    fn update_proof(&self, id: TaskId, proof: &[u8], proof_time_sec: u64) -> Result<()> {
        let mut tables = self.lock();
        if !tables.tasks.contains_key(&id) {
            return Err(anyhow!("task {id} not found"));
        }
        tables.proofs.insert(
            id,
            ProofRecord {
                task_id: id,
                proof: proof.to_vec(),
                proof_time_sec,
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get_proof(&self, id: TaskId) -> Result<Option<ProofRecord>> {
        Ok(self.lock().proofs.get(&id).cloned())
    }

    fn insert_task(&self, traces: Vec<BlockTrace>) -> Result<TaskId> {
        let mut tables = self.lock();
        let id = tables.tasks.keys().next_back().map_or(1, |last| last + 1);
        let now = Utc::now();
        let record = TaskRecord {
            id,
            status: TaskStatus::Unassigned,
            block_count: traces.len(),
            created_at: now,
            updated_at: now,
        };
        tables.tasks.insert(id, (record, traces));
        Ok(id)
    }
}
