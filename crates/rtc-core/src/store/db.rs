//! Durable attempt store using redb.
//!
//! # Table design
//!
//! ```text
//! orchestrations: instance_id (&str) → JSON OrchestrationState
//! checkpoints:    instance_id (&str) → JSON Checkpoint
//! ```
//!
//! Every ledger operation runs inside one write transaction: the current
//! record is read, the op is applied in memory, and the result is written
//! back before commit. A failed op aborts the transaction so nothing partial
//! is ever persisted.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::attempt::{OrchestrationState, StoreOp};
use crate::checkpoint::Checkpoint;
use crate::error::{Result, RtcError};

use super::AttemptStore;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const ORCHESTRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("orchestrations");
const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

fn db_err(e: impl std::fmt::Display) -> RtcError {
    RtcError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// RedbStore
// ---------------------------------------------------------------------------

/// Persistent, crash-consistent store for `OrchestrationState` records.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the redb database at `path`.
    ///
    /// Creates both tables if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        // Ensure the tables exist before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(ORCHESTRATIONS).map_err(db_err)?;
        wt.open_table(CHECKPOINTS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }
}

impl AttemptStore for RedbStore {
    fn apply(&self, instance_id: &str, op: StoreOp) -> Result<OrchestrationState> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let state = {
            let mut table = wt.open_table(ORCHESTRATIONS).map_err(db_err)?;
            let current = table
                .get(instance_id)
                .map_err(db_err)?
                .map(|v| v.value().to_vec());
            let mut state = match current {
                Some(bytes) => serde_json::from_slice::<OrchestrationState>(&bytes)?,
                None => OrchestrationState::new(instance_id),
            };
            if let Err(e) = state.apply(&op) {
                drop(table);
                wt.abort().map_err(db_err)?;
                return Err(e);
            }
            let value = serde_json::to_vec(&state)?;
            table
                .insert(instance_id, value.as_slice())
                .map_err(db_err)?;
            state
        };
        wt.commit().map_err(db_err)?;
        debug!(instance_id, op = ?op, "store: applied");
        Ok(state)
    }

    fn get(&self, instance_id: &str) -> Result<Option<OrchestrationState>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ORCHESTRATIONS).map_err(db_err)?;
        match table.get(instance_id).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn delete(&self, instance_id: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let removed = {
            let mut orchestrations = wt.open_table(ORCHESTRATIONS).map_err(db_err)?;
            let mut checkpoints = wt.open_table(CHECKPOINTS).map_err(db_err)?;
            let state = orchestrations.remove(instance_id).map_err(db_err)?.is_some();
            let checkpoint = checkpoints.remove(instance_id).map_err(db_err)?.is_some();
            state || checkpoint
        };
        wt.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn list_instances(&self) -> Result<Vec<String>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(ORCHESTRATIONS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            result.push(k.value().to_string());
        }
        Ok(result)
    }

    fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let value = serde_json::to_vec(checkpoint)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(CHECKPOINTS).map_err(db_err)?;
            table
                .insert(checkpoint.instance_id.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        debug!(
            instance_id = %checkpoint.instance_id,
            step = checkpoint.step.as_str(),
            "store: checkpoint"
        );
        Ok(())
    }

    fn get_checkpoint(&self, instance_id: &str) -> Result<Option<Checkpoint>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CHECKPOINTS).map_err(db_err)?;
        match table.get(instance_id).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn pending_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(CHECKPOINTS).map_err(db_err)?;
        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let cp: Checkpoint = serde_json::from_slice(v.value())?;
            if !cp.step.is_terminal() {
                result.push(cp);
            }
        }
        result.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptState;
    use crate::store::contract;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_tmp() -> (TempDir, RedbStore) {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(&dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn get_unknown_returns_none() {
        let (_dir, store) = open_tmp();
        contract::get_unknown_returns_none(&store);
    }

    #[test]
    fn first_mutation_creates_instance() {
        let (_dir, store) = open_tmp();
        contract::first_mutation_creates_instance(&store);
    }

    #[test]
    fn attempt_lifecycle() {
        let (_dir, store) = open_tmp();
        contract::attempt_lifecycle(&store);
    }

    #[test]
    fn duplicate_attempt_fails() {
        let (_dir, store) = open_tmp();
        contract::duplicate_attempt_fails(&store);
    }

    #[test]
    fn unknown_attempt_fails() {
        let (_dir, store) = open_tmp();
        contract::unknown_attempt_fails(&store);
    }

    #[test]
    fn snapshot_is_detached() {
        let (_dir, store) = open_tmp();
        contract::snapshot_is_detached(&store);
    }

    #[test]
    fn reset_and_delete() {
        let (_dir, store) = open_tmp();
        contract::reset_and_delete(&store);
    }

    #[test]
    fn pending_checkpoints_skip_terminal() {
        let (_dir, store) = open_tmp();
        contract::pending_checkpoints_skip_terminal(&store);
    }

    #[test]
    fn concurrent_writers_do_not_lose_attempts() {
        let (_dir, store) = open_tmp();
        contract::concurrent_writers_do_not_lose_attempts(Arc::new(store));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("durable.redb");
        let id = Uuid::new_v4();
        {
            let store = RedbStore::open(&path).unwrap();
            store.add_attempt("inst", id).unwrap();
            store
                .update_attempt_state("inst", id, AttemptState::WaitingForCallback)
                .unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let st = store.get("inst").unwrap().unwrap();
        assert_eq!(st.attempt(&id).unwrap().state, AttemptState::WaitingForCallback);
    }

    #[test]
    fn failed_op_leaves_record_untouched() {
        let (_dir, store) = open_tmp();
        let id = Uuid::new_v4();
        store.add_attempt("inst", id).unwrap();
        let before = store.get("inst").unwrap().unwrap();
        assert!(store.add_attempt("inst", id).is_err());
        assert_eq!(store.get("inst").unwrap().unwrap(), before);
    }

    #[test]
    fn failed_op_on_unknown_instance_creates_nothing() {
        let (_dir, store) = open_tmp();
        assert!(store
            .update_attempt_state("ghost", Uuid::new_v4(), AttemptState::Executing)
            .is_err());
        assert!(store.get("ghost").unwrap().is_none());
    }
}
