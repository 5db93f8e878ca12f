use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use tracing::info;
use zelana_config::OrderSession;
use zephyr::BlockTrace;

use super::{ProofRecord, TaskId, TaskRecord, TaskStatus, TaskStore};

const CF_TASKS: &str = "tasks";
const CF_TRACES: &str = "traces";
const CF_PROOFS: &str = "proofs";
/// Secondary index: `[status tag][task id]` -> empty.
const CF_STATUS: &str = "task_status";

/// A thread-safe wrapper around RocksDB.
///
/// Keys are big-endian task ids so iteration order is task order. The
/// `task_status` index keeps dispatch lookups proportional to the number of
/// tasks in the wanted status, not to the whole history.
#[derive(Clone)]
pub struct RocksTaskStore {
    db: Arc<DB>,
    /// Serializes id allocation and status index maintenance.
    write_lock: Arc<Mutex<()>>,
}

impl RocksTaskStore {
    /// Opens the database at the specified path, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = vec![
            ColumnFamilyDescriptor::new(CF_TASKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRACES, Options::default()),
            ColumnFamilyDescriptor::new(CF_PROOFS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATUS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, families)
            .map_err(|e| anyhow!("Failed to open RocksDB: {}", e))?;

        let store = Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        };
        store.backfill_status_index()?;
        Ok(store)
    }

    /// Databases written before the index existed have tasks but no entries.
    fn backfill_status_index(&self) -> Result<()> {
        let indexed = self
            .db
            .iterator_cf(self.cf(CF_STATUS)?, IteratorMode::Start)
            .next()
            .is_some();
        if indexed {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        for record in self.scan_tasks(IteratorMode::Start)? {
            let record = record?;
            batch.put_cf(self.cf(CF_STATUS)?, status_key(record.status, record.id), b"");
            count += 1;
        }
        if count > 0 {
            self.db.write(batch)?;
            info!(count, "rebuilt task status index");
        }
        Ok(())
    }

    /// Up to `limit` ids with `status`, in `order`.
    fn ids_with_status(
        &self,
        status: TaskStatus,
        order: OrderSession,
        limit: usize,
    ) -> Result<Vec<TaskId>> {
        let tag = status_tag(status);
        let (start, direction) = match order {
            OrderSession::Asc => (status_key(status, 0), Direction::Forward),
            OrderSession::Desc => (status_key(status, TaskId::MAX), Direction::Reverse),
        };
        let mut ids = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf(CF_STATUS)?, IteratorMode::From(&start, direction));
        for item in iter {
            if ids.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if key.first() != Some(&tag) {
                break;
            }
            ids.push(decode_key(&key[1..])?);
        }
        Ok(ids)
    }

    fn tasks_with_status(
        &self,
        status: TaskStatus,
        order: OrderSession,
        limit: usize,
    ) -> Result<Vec<TaskRecord>> {
        let mut out = Vec::new();
        for id in self.ids_with_status(status, order, limit)? {
            match self.read_task(id)? {
                Some(record) if record.status == status => out.push(record),
                _ => {}
            }
        }
        Ok(out)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' missing", name))
    }

    fn read_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        match self.db.get_cf(self.cf(CF_TASKS)?, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_tasks(
        &self,
        mode: IteratorMode<'static>,
    ) -> Result<impl Iterator<Item = Result<TaskRecord>> + '_> {
        let iter = self.db.iterator_cf(self.cf(CF_TASKS)?, mode);
        Ok(iter.map(|item| {
            let (_, value) = item?;
            Ok(serde_json::from_slice::<TaskRecord>(&value)?)
        }))
    }
}

fn status_tag(status: TaskStatus) -> u8 {
    match status {
        TaskStatus::Unassigned => 0,
        TaskStatus::Assigned => 1,
        TaskStatus::Proved => 2,
        TaskStatus::Verified => 3,
        TaskStatus::Failed => 4,
    }
}

fn status_key(status: TaskStatus, id: TaskId) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = status_tag(status);
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

fn decode_key(key: &[u8]) -> Result<TaskId> {
    let arr: [u8; 8] = key
        .try_into()
        .map_err(|_| anyhow!("corrupt task key of {} bytes", key.len()))?;
    Ok(TaskId::from_be_bytes(arr))
}

impl TaskStore for RocksTaskStore {
    fn get_unassigned_tasks(&self, limit: usize, order: OrderSession) -> Result<Vec<TaskRecord>> {
        self.tasks_with_status(TaskStatus::Unassigned, order, limit)
    }

    fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        self.tasks_with_status(status, OrderSession::Asc, usize::MAX)
    }

    fn get_task_traces(&self, id: TaskId) -> Result<Vec<BlockTrace>> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_TRACES)?, id.to_be_bytes())?
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>> {
        self.read_task(id)
    }

    fn update_task_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut record = self
            .read_task(id)?
            .ok_or_else(|| anyhow!("task {id} not found"))?;
        let previous = record.status;
        record.status = status;
        record.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        if previous != status {
            batch.delete_cf(self.cf(CF_STATUS)?, status_key(previous, id));
            batch.put_cf(self.cf(CF_STATUS)?, status_key(status, id), b"");
        }
        batch.put_cf(self.cf(CF_TASKS)?, id.to_be_bytes(), serde_json::to_vec(&record)?);
        self.db.write(batch)?;
        Ok(())
    }

    fn update_proof(&self, id: TaskId, proof: &[u8], proof_time_sec: u64) -> Result<()> {
        if self.read_task(id)?.is_none() {
            return Err(anyhow!("task {id} not found"));
        }
        let record = ProofRecord {
            task_id: id,
            proof: proof.to_vec(),
            proof_time_sec,
            stored_at: Utc::now(),
        };
        self.db.put_cf(
            self.cf(CF_PROOFS)?,
            id.to_be_bytes(),
            serde_json::to_vec(&record)?,
        )?;
        Ok(())
    }

    fn get_proof(&self, id: TaskId) -> Result<Option<ProofRecord>> {
        match self.db.get_cf(self.cf(CF_PROOFS)?, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_task(&self, traces: Vec<BlockTrace>) -> Result<TaskId> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let last = match self
            .db
            .iterator_cf(self.cf(CF_TASKS)?, IteratorMode::End)
            .next()
        {
            Some(item) => Some(decode_key(&item?.0)?),
            None => None,
        };
        let id = last.map_or(1, |l| l + 1);

        let now = Utc::now();
        let record = TaskRecord {
            id,
            status: TaskStatus::Unassigned,
            block_count: traces.len(),
            created_at: now,
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TASKS)?, id.to_be_bytes(), serde_json::to_vec(&record)?);
        batch.put_cf(self.cf(CF_TRACES)?, id.to_be_bytes(), serde_json::to_vec(&traces)?);
        batch.put_cf(self.cf(CF_STATUS)?, status_key(TaskStatus::Unassigned, id), b"");
        self.db.write(batch)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (TempDir, RocksTaskStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksTaskStore::open(temp_dir.path()).unwrap();
        (temp_dir, store)
    }

    fn trace(n: u64) -> BlockTrace {
        BlockTrace {
            number: n,
            hash: format!("0x{:02x}", n),
            trace: serde_json::json!({ "block": n }),
        }
    }

    #[test]
    fn test_insert_and_read_back() {
        let (_dir, store) = create_test_db();
        let id = store.insert_task(vec![trace(7), trace(8)]).unwrap();
        assert_eq!(id, 1);

        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Unassigned);
        assert_eq!(task.block_count, 2);

        let traces = store.get_task_traces(id).unwrap();
        assert_eq!(traces, vec![trace(7), trace(8)]);
    }

    #[test]
    fn test_ids_follow_key_order_past_255() {
        let (_dir, store) = create_test_db();
        for n in 0..300 {
            store.insert_task(vec![trace(n)]).unwrap();
        }
        let desc = store.get_unassigned_tasks(2, OrderSession::Desc).unwrap();
        assert_eq!(desc[0].id, 300);
        assert_eq!(desc[1].id, 299);

        let asc = store.get_unassigned_tasks(1, OrderSession::Asc).unwrap();
        assert_eq!(asc[0].id, 1);
    }

    #[test]
    fn test_status_updates_filter_unassigned() {
        let (_dir, store) = create_test_db();
        for n in 0..4 {
            store.insert_task(vec![trace(n)]).unwrap();
        }
        store.update_task_status(1, TaskStatus::Assigned).unwrap();
        store.update_task_status(2, TaskStatus::Verified).unwrap();

        let ids: Vec<_> = store
            .get_unassigned_tasks(10, OrderSession::Asc)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(store.get_tasks_by_status(TaskStatus::Assigned).unwrap().len(), 1);
    }

    #[test]
    fn test_proof_round_trip_and_missing_task() {
        let (_dir, store) = create_test_db();
        let id = store.insert_task(vec![trace(1)]).unwrap();
        store.update_proof(id, &[0xaa, 0xbb], 12).unwrap();
        let proof = store.get_proof(id).unwrap().unwrap();
        assert_eq!(proof.proof, vec![0xaa, 0xbb]);
        assert_eq!(proof.proof_time_sec, 12);

        assert!(store.update_proof(99, &[1], 1).is_err());
        assert!(store.update_task_status(99, TaskStatus::Failed).is_err());
        assert!(store.get_task_traces(99).is_err());
    }

    #[test]
    fn test_status_index_follows_updates() {
        let (_dir, store) = create_test_db();
        for n in 0..6 {
            store.insert_task(vec![trace(n)]).unwrap();
        }
        for id in 1..=4 {
            store.update_task_status(id, TaskStatus::Verified).unwrap();
        }
        store.update_task_status(5, TaskStatus::Assigned).unwrap();
        store.update_task_status(5, TaskStatus::Unassigned).unwrap();

        let ids = store
            .ids_with_status(TaskStatus::Unassigned, OrderSession::Asc, usize::MAX)
            .unwrap();
        assert_eq!(ids, vec![5, 6]);
        let desc = store
            .ids_with_status(TaskStatus::Verified, OrderSession::Desc, 2)
            .unwrap();
        assert_eq!(desc, vec![4, 3]);
        assert!(store
            .ids_with_status(TaskStatus::Assigned, OrderSession::Asc, usize::MAX)
            .unwrap()
            .is_empty());
        assert!(store
            .ids_with_status(TaskStatus::Failed, OrderSession::Desc, usize::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_status_index_backfilled_on_open() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = RocksTaskStore::open(temp_dir.path()).unwrap();
            store.insert_task(vec![trace(1)]).unwrap();
            store.insert_task(vec![trace(2)]).unwrap();
            store.update_task_status(1, TaskStatus::Failed).unwrap();
            // Simulate a database written before the index existed.
            let cf = store.cf(CF_STATUS).unwrap();
            store.db.delete_cf(cf, status_key(TaskStatus::Failed, 1)).unwrap();
            store.db.delete_cf(cf, status_key(TaskStatus::Unassigned, 2)).unwrap();
        }
        let store = RocksTaskStore::open(temp_dir.path()).unwrap();
        let unassigned = store.get_unassigned_tasks(10, OrderSession::Asc).unwrap();
        assert_eq!(unassigned.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.get_tasks_by_status(TaskStatus::Failed).unwrap()[0].id, 1);
    }

    #[test]
    fn test_reopen_keeps_tasks() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = RocksTaskStore::open(temp_dir.path()).unwrap();
            store.insert_task(vec![trace(1)]).unwrap();
            store.update_task_status(1, TaskStatus::Assigned).unwrap();
        }
        let store = RocksTaskStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            store.get_task(1).unwrap().unwrap().status,
            TaskStatus::Assigned
        );
        assert_eq!(store.insert_task(vec![trace(2)]).unwrap(), 2);
    }
}
