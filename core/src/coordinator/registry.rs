//! Worker Registry
//!
//! Concurrent map from worker public key to connection state. Entries survive
//! disconnects so in-flight accounting carries over to the next connection.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use zelana_pubkey::Pubkey;
use zephyr::{TaskMsg, WorkerIdentity};

use super::CoordinatorError;
use crate::store::TaskId;

/// Registry entry for one worker.
#[derive(Debug)]
pub struct WorkerNode {
    pub identity: WorkerIdentity,
    task_tx: mpsc::Sender<TaskMsg>,
    task_ids: HashSet<TaskId>,
    registered_at: Instant,
    pub registered_at_utc: DateTime<Utc>,
    pub dispatched: u64,
    pub completed: u64,
}

impl WorkerNode {
    fn is_connected(&self) -> bool {
        !self.task_tx.is_closed()
    }

    fn is_idle(&self) -> bool {
        self.task_ids.is_empty() && self.is_connected()
    }
}

/// Point-in-time copy of a registry entry.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub pubkey: Pubkey,
    pub identity: WorkerIdentity,
    pub task_ids: Vec<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub connected: bool,
    pub dispatched: u64,
    pub completed: u64,
}

pub struct WorkerRegistry {
    workers: DashMap<Pubkey, WorkerNode>,
    channel_capacity: usize,
    cooldown: Duration,
}

impl WorkerRegistry {
    pub fn new(channel_capacity: usize, cooldown: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            channel_capacity: channel_capacity.max(1),
            cooldown,
        }
    }

    /// Registers (or re-registers) a worker and returns its task stream.
    ///
    /// `in_flight` replaces the worker's dispatched set, rebuilt by the caller
    /// from live sessions. Within the cooldown the existing entry and its
    /// channel are left untouched.
    pub fn register(
        &self,
        identity: WorkerIdentity,
        in_flight: HashSet<TaskId>,
    ) -> Result<mpsc::Receiver<TaskMsg>, CoordinatorError> {
        let pubkey = identity.public_key;
        let (task_tx, task_rx) = mpsc::channel(self.channel_capacity);
        let now = Instant::now();

        match self.workers.entry(pubkey) {
            Entry::Occupied(mut entry) => {
                let node = entry.get_mut();
                if now.duration_since(node.registered_at) < self.cooldown {
                    return Err(CoordinatorError::ReconnectTooFrequent(pubkey));
                }
                node.identity = identity;
                node.task_tx = task_tx;
                node.task_ids = in_flight;
                node.registered_at = now;
                node.registered_at_utc = Utc::now();
                info!(worker = %node.identity.name, pubkey = %pubkey, in_flight = node.task_ids.len(), "worker re-registered");
            }
            Entry::Vacant(entry) => {
                info!(worker = %identity.name, pubkey = %pubkey, "worker registered");
                entry.insert(WorkerNode {
                    identity,
                    task_tx,
                    task_ids: in_flight,
                    registered_at: now,
                    registered_at_utc: Utc::now(),
                    dispatched: 0,
                    completed: 0,
                });
            }
        }
        Ok(task_rx)
    }

    /// Number of connected workers with nothing in flight.
    pub fn idle_count(&self) -> usize {
        self.workers.iter().filter(|n| n.is_idle()).count()
    }

    /// Uniform random pick among idle workers, skipping `exclude`.
    pub fn select_idle(&self, exclude: &[Pubkey]) -> Option<Pubkey> {
        let candidates: Vec<Pubkey> = self
            .workers
            .iter()
            .filter(|n| n.is_idle() && !exclude.contains(n.key()))
            .map(|n| *n.key())
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Pushes a task onto the worker's channel without waiting.
    pub fn dispatch(&self, pubkey: &Pubkey, task: TaskMsg) -> Result<(), CoordinatorError> {
        let node = self
            .workers
            .get(pubkey)
            .ok_or(CoordinatorError::UnknownWorker(*pubkey))?;
        match node.task_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Err(CoordinatorError::WorkerBusy(*pubkey))
            }
        }
    }

    pub fn record_dispatch(&self, pubkey: &Pubkey, task_id: TaskId) {
        match self.workers.get_mut(pubkey) {
            Some(mut node) => {
                node.task_ids.insert(task_id);
                node.dispatched += 1;
            }
            None => warn!(pubkey = %pubkey, task_id, "record_dispatch for unknown worker"),
        }
    }

    /// Clears `task_id` from the worker's in-flight set.
    pub fn record_completion(&self, pubkey: &Pubkey, task_id: TaskId) {
        match self.workers.get_mut(pubkey) {
            Some(mut node) => {
                if node.task_ids.remove(&task_id) {
                    node.completed += 1;
                }
            }
            None => debug!(pubkey = %pubkey, task_id, "record_completion for unknown worker"),
        }
    }

    /// Undoes a `record_dispatch` whose push never reached the worker.
    pub fn release(&self, pubkey: &Pubkey, task_id: TaskId) {
        if let Some(mut node) = self.workers.get_mut(pubkey) {
            if node.task_ids.remove(&task_id) {
                node.dispatched = node.dispatched.saturating_sub(1);
            }
        }
    }

    pub fn name_of(&self, pubkey: &Pubkey) -> Option<String> {
        self.workers.get(pubkey).map(|n| n.identity.name.clone())
    }

    #[cfg(test)]
    fn in_flight(&self, pubkey: &Pubkey) -> Option<HashSet<TaskId>> {
        self.workers.get(pubkey).map(|n| n.task_ids.clone())
    }

    #[cfg(test)]
    fn is_connected(&self, pubkey: &Pubkey) -> bool {
        self.workers.get(pubkey).is_some_and(|n| n.is_connected())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> = self
            .workers
            .iter()
            .map(|n| {
                let mut task_ids: Vec<TaskId> = n.task_ids.iter().copied().collect();
                task_ids.sort_unstable();
                WorkerSnapshot {
                    pubkey: *n.key(),
                    identity: n.identity.clone(),
                    task_ids,
                    registered_at: n.registered_at_utc,
                    connected: n.is_connected(),
                    dispatched: n.dispatched,
                    completed: n.completed,
                }
            })
            .collect();
        out.sort_by(|a, b| a.identity.name.cmp(&b.identity.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seed: u8) -> WorkerIdentity {
        WorkerIdentity {
            name: format!("prover-{seed}"),
            public_key: Pubkey([seed; 32]),
            version: "v0.1.0".into(),
            timestamp: 0,
            nonce: 0,
        }
    }

    fn task(id: TaskId) -> TaskMsg {
        TaskMsg { id, traces: vec![] }
    }

    #[test]
    fn test_register_and_idle_count() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let _rx1 = reg.register(identity(1), HashSet::new()).unwrap();
        let _rx2 = reg.register(identity(2), HashSet::new()).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.idle_count(), 2);

        reg.record_dispatch(&Pubkey([1; 32]), 10);
        assert_eq!(reg.idle_count(), 1);
        assert_eq!(reg.select_idle(&[]), Some(Pubkey([2; 32])));

        reg.record_completion(&Pubkey([1; 32]), 10);
        assert_eq!(reg.idle_count(), 2);
    }

    #[test]
    fn test_reconnect_within_cooldown_keeps_channel() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let mut rx = reg.register(identity(1), HashSet::new()).unwrap();

        let err = reg.register(identity(1), HashSet::new()).unwrap_err();
        assert!(matches!(err, CoordinatorError::ReconnectTooFrequent(_)));

        reg.dispatch(&Pubkey([1; 32]), task(3)).unwrap();
        assert_eq!(rx.try_recv().unwrap().id, 3);
    }

    #[test]
    fn test_reconnect_after_cooldown_replaces_channel() {
        let reg = WorkerRegistry::new(4, Duration::ZERO);
        let mut old_rx = reg.register(identity(1), HashSet::new()).unwrap();
        let mut new_rx = reg.register(identity(1), HashSet::from([7])).unwrap();

        assert_eq!(reg.in_flight(&Pubkey([1; 32])).unwrap(), HashSet::from([7]));
        reg.dispatch(&Pubkey([1; 32]), task(8)).unwrap();
        assert_eq!(new_rx.try_recv().unwrap().id, 8);
        assert!(old_rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_is_busy() {
        let reg = WorkerRegistry::new(1, Duration::from_secs(60));
        let _rx = reg.register(identity(1), HashSet::new()).unwrap();
        let pk = Pubkey([1; 32]);
        reg.dispatch(&pk, task(1)).unwrap();
        assert!(matches!(
            reg.dispatch(&pk, task(2)),
            Err(CoordinatorError::WorkerBusy(_))
        ));
    }

    #[test]
    fn test_disconnected_worker_is_not_idle() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let rx = reg.register(identity(1), HashSet::new()).unwrap();
        drop(rx);

        assert_eq!(reg.idle_count(), 0);
        assert_eq!(reg.select_idle(&[]), None);
        assert!(!reg.is_connected(&Pubkey([1; 32])));
        assert!(matches!(
            reg.dispatch(&Pubkey([1; 32]), task(1)),
            Err(CoordinatorError::WorkerBusy(_))
        ));
        // Entry stays for in-flight accounting.
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unknown_worker_is_noop() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let ghost = Pubkey([9; 32]);
        reg.record_dispatch(&ghost, 1);
        reg.record_completion(&ghost, 1);
        reg.release(&ghost, 1);
        assert!(reg.is_empty());
        assert!(matches!(
            reg.dispatch(&ghost, task(1)),
            Err(CoordinatorError::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_select_idle_respects_exclusions() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let _a = reg.register(identity(1), HashSet::new()).unwrap();
        let _b = reg.register(identity(2), HashSet::new()).unwrap();
        assert_eq!(reg.select_idle(&[Pubkey([1; 32])]), Some(Pubkey([2; 32])));
        assert_eq!(reg.select_idle(&[Pubkey([1; 32]), Pubkey([2; 32])]), None);
    }

    #[test]
    fn test_select_idle_reaches_every_candidate() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let _rxs: Vec<_> = (1..=3)
            .map(|s| reg.register(identity(s), HashSet::new()).unwrap())
            .collect();

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(reg.select_idle(&[]).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_snapshot_counts() {
        let reg = WorkerRegistry::new(4, Duration::from_secs(60));
        let _rx = reg.register(identity(1), HashSet::new()).unwrap();
        let pk = Pubkey([1; 32]);
        reg.record_dispatch(&pk, 4);
        reg.record_completion(&pk, 4);
        reg.record_dispatch(&pk, 5);

        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].task_ids, vec![5]);
        assert_eq!(snap[0].dispatched, 2);
        assert_eq!(snap[0].completed, 1);
        assert!(snap[0].connected);
    }
}
