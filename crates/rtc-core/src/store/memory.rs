//! In-process attempt store.
//!
//! Each instance id owns its own `Mutex` partition, so writes to one instance
//! never wait on another. The outer map lock is only held long enough to
//! look up, insert or prune a partition. Lock order is always map, then
//! partition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::attempt::{OrchestrationState, StoreOp};
use crate::checkpoint::Checkpoint;
use crate::error::{Result, RtcError};

use super::AttemptStore;

type Partition = Arc<Mutex<Option<OrchestrationState>>>;

fn poisoned<T>(_: T) -> RtcError {
    RtcError::Store("lock poisoned".to_string())
}

#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<HashMap<String, Partition>>,
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, instance_id: &str) -> Result<Partition> {
        if let Some(p) = self.partitions.read().map_err(poisoned)?.get(instance_id) {
            return Ok(p.clone());
        }
        let mut map = self.partitions.write().map_err(poisoned)?;
        Ok(map
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }

    /// Remove `instance_id`'s partition if it is empty and no writer holds
    /// it. Handles are only handed out under the map lock, so the count
    /// cannot grow while we hold the write lock.
    fn prune(&self, instance_id: &str) -> Result<()> {
        let mut map = self.partitions.write().map_err(poisoned)?;
        let idle = match map.get(instance_id) {
            Some(p) => Arc::strong_count(p) == 1 && p.lock().map_err(poisoned)?.is_none(),
            None => false,
        };
        if idle {
            map.remove(instance_id);
        }
        Ok(())
    }
}

impl AttemptStore for MemoryStore {
    fn apply(&self, instance_id: &str, op: StoreOp) -> Result<OrchestrationState> {
        let result = {
            let partition = self.partition(instance_id)?;
            let mut slot = partition.lock().map_err(poisoned)?;
            let mut state = slot
                .clone()
                .unwrap_or_else(|| OrchestrationState::new(instance_id));
            match state.apply(&op) {
                Ok(()) => {
                    *slot = Some(state.clone());
                    Ok(state)
                }
                Err(e) => Err(e),
            }
        };
        if result.is_err() {
            self.prune(instance_id)?;
        }
        result
    }

    fn get(&self, instance_id: &str) -> Result<Option<OrchestrationState>> {
        let partition = match self.partitions.read().map_err(poisoned)?.get(instance_id) {
            Some(p) => p.clone(),
            None => return Ok(None),
        };
        let slot = partition.lock().map_err(poisoned)?;
        Ok(slot.clone())
    }

    fn delete(&self, instance_id: &str) -> Result<bool> {
        let removed_state = match self.partitions.read().map_err(poisoned)?.get(instance_id) {
            Some(p) => p.lock().map_err(poisoned)?.take().is_some(),
            None => false,
        };
        let removed_cp = self
            .checkpoints
            .lock()
            .map_err(poisoned)?
            .remove(instance_id)
            .is_some();
        self.prune(instance_id)?;
        Ok(removed_state || removed_cp)
    }

    fn list_instances(&self) -> Result<Vec<String>> {
        let map = self.partitions.read().map_err(poisoned)?;
        let mut ids = Vec::new();
        for (id, p) in map.iter() {
            if p.lock().map_err(poisoned)?.is_some() {
                ids.push(id.clone());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .map_err(poisoned)?
            .insert(checkpoint.instance_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn get_checkpoint(&self, instance_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .map_err(poisoned)?
            .get(instance_id)
            .cloned())
    }

    fn pending_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let mut pending: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .map_err(poisoned)?
            .values()
            .filter(|cp| !cp.step.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptState;
    use crate::store::contract;
    use uuid::Uuid;

    #[test]
    fn get_unknown_returns_none() {
        contract::get_unknown_returns_none(&MemoryStore::new());
    }

    #[test]
    fn first_mutation_creates_instance() {
        contract::first_mutation_creates_instance(&MemoryStore::new());
    }

    #[test]
    fn attempt_lifecycle() {
        contract::attempt_lifecycle(&MemoryStore::new());
    }

    #[test]
    fn duplicate_attempt_fails() {
        contract::duplicate_attempt_fails(&MemoryStore::new());
    }

    #[test]
    fn unknown_attempt_fails() {
        contract::unknown_attempt_fails(&MemoryStore::new());
    }

    #[test]
    fn snapshot_is_detached() {
        contract::snapshot_is_detached(&MemoryStore::new());
    }

    #[test]
    fn reset_and_delete() {
        contract::reset_and_delete(&MemoryStore::new());
    }

    #[test]
    fn pending_checkpoints_skip_terminal() {
        contract::pending_checkpoints_skip_terminal(&MemoryStore::new());
    }

    #[test]
    fn concurrent_writers_do_not_lose_attempts() {
        contract::concurrent_writers_do_not_lose_attempts(Arc::new(MemoryStore::new()));
    }

    #[test]
    fn failed_op_on_unknown_instance_creates_nothing() {
        let store = MemoryStore::new();
        assert!(store
            .update_attempt_state("ghost", Uuid::new_v4(), AttemptState::Executing)
            .is_err());
        assert!(store.get("ghost").unwrap().is_none());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.partitions.read().unwrap().is_empty());
    }

    #[test]
    fn delete_drops_the_partition() {
        let store = MemoryStore::new();
        store.add_attempt("gone", Uuid::new_v4()).unwrap();
        assert_eq!(store.partitions.read().unwrap().len(), 1);
        assert!(store.delete("gone").unwrap());
        assert!(store.partitions.read().unwrap().is_empty());
        assert!(!store.delete("gone").unwrap());
    }

    #[test]
    fn partition_held_by_a_writer_is_not_pruned() {
        let store = MemoryStore::new();
        let held = store.partition("busy").unwrap();
        assert!(store
            .update_attempt_state("busy", Uuid::new_v4(), AttemptState::Executing)
            .is_err());
        assert!(store.partitions.read().unwrap().contains_key("busy"));

        // The writer's eventual success lands in the live partition.
        *held.lock().unwrap() = Some(OrchestrationState::new("busy"));
        drop(held);
        assert_eq!(store.list_instances().unwrap(), vec!["busy".to_string()]);
    }
}
