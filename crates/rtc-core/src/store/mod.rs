//! Attempt state store.
//!
//! `AttemptStore` exposes one typed method per ledger operation. Every method
//! funnels into `apply`, which implementations must run as a single atomic
//! read-modify-write for the given instance id. Different instance ids never
//! contend with each other at this layer.

pub mod db;
pub mod memory;

pub use db::RedbStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::attempt::{AttemptState, OrchestrationState, StoreOp};
use crate::checkpoint::Checkpoint;
use crate::error::Result;

pub trait AttemptStore: Send + Sync {
    /// Atomically apply `op` to the state of `instance_id`, creating the
    /// default state on first mutation. Returns the resulting snapshot.
    fn apply(&self, instance_id: &str, op: StoreOp) -> Result<OrchestrationState>;

    /// Snapshot copy of the state, if the instance exists.
    fn get(&self, instance_id: &str) -> Result<Option<OrchestrationState>>;

    /// Remove the whole record (and its checkpoint). Returns whether anything
    /// was removed.
    fn delete(&self, instance_id: &str) -> Result<bool>;

    fn list_instances(&self) -> Result<Vec<String>>;

    fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    fn get_checkpoint(&self, instance_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints whose step is not terminal.
    fn pending_checkpoints(&self) -> Result<Vec<Checkpoint>>;

    // -----------------------------------------------------------------------
    // Typed ledger operations
    // -----------------------------------------------------------------------

    fn add_attempt(&self, instance_id: &str, attempt_id: Uuid) -> Result<()> {
        self.apply(instance_id, StoreOp::add_attempt(attempt_id))
            .map(|_| ())
    }

    fn update_attempt_state(
        &self,
        instance_id: &str,
        attempt_id: Uuid,
        state: AttemptState,
    ) -> Result<()> {
        self.apply(instance_id, StoreOp::set_state(attempt_id, state))
            .map(|_| ())
    }

    fn update_attempt_message(
        &self,
        instance_id: &str,
        attempt_id: Uuid,
        message: &str,
    ) -> Result<()> {
        self.apply(instance_id, StoreOp::set_message(attempt_id, message))
            .map(|_| ())
    }

    fn update_attempt_timeout_due(
        &self,
        instance_id: &str,
        attempt_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.apply(instance_id, StoreOp::set_timeout_due(attempt_id, deadline))
            .map(|_| ())
    }

    fn update_overall_state(&self, instance_id: &str, text: &str) -> Result<()> {
        self.apply(instance_id, StoreOp::set_overall_state(text))
            .map(|_| ())
    }

    /// Clear all attempts, keeping the record itself.
    fn reset(&self, instance_id: &str) -> Result<()> {
        self.apply(instance_id, StoreOp::Reset).map(|_| ())
    }
}
