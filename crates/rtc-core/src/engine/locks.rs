//! Per-instance exclusive sections.
//!
//! A run holds its instance's guard from the first step to completion,
//! including the whole callback wait. Management operations use `try_lock`
//! and back off with `InstanceBusy` instead of queueing behind a wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Result, RtcError};

pub type InstanceGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct InstanceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Drop idle entries so the map tracks live instances only.
        map.retain(|_, m| Arc::strong_count(m) > 1);
        map.entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `instance_id`.
    pub async fn lock(&self, instance_id: &str) -> InstanceGuard {
        self.entry(instance_id).lock_owned().await
    }

    /// Exclusive access without waiting; `InstanceBusy` if a run holds it.
    pub fn try_lock(&self, instance_id: &str) -> Result<InstanceGuard> {
        self.entry(instance_id)
            .try_lock_owned()
            .map_err(|_| RtcError::InstanceBusy(instance_id.to_string()))
    }

    pub fn is_locked(&self, instance_id: &str) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(instance_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}
