//! Callback correlation and deadline racing.
//!
//! `CallbackHub` keeps at most one armed slot per correlation key, tagged
//! with the attempt it belongs to. A slot is resolved exactly once: either
//! `deliver` removes it and sends the success flag, or the waiting side
//! removes it when its deadline fires. Both removals happen under the hub
//! lock, and `deliver` sends while still holding it, so the side that loses
//! the race always knows it lost:
//!
//! - deadline wins: the slot is gone, a late `deliver` finds nothing and is a
//!   no-op (`Delivery::NoWaiter`).
//! - callback wins: the waiter finds its slot already taken and the value is
//!   guaranteed to be sitting in the channel.
//!
//! A slot is armed before its attempt is dispatched. Until the waiter calls
//! `CallbackWait::open` it only accepts callbacks naming its attempt id, so a
//! late callback for an earlier attempt cannot resolve a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a callback wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitOutcome {
    Delivered { success: bool },
    TimedOut,
}

/// Result of offering a callback to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// An outstanding wait was resolved with the flag.
    Resolved,
    /// Nothing was waiting on this key; the callback was dropped.
    NoWaiter,
    /// A wait is armed, but for a different attempt; the callback was dropped
    /// and the wait left in place.
    Stale,
}

// ---------------------------------------------------------------------------
// CallbackHub
// ---------------------------------------------------------------------------

struct Slot {
    token: u64,
    attempt_id: Uuid,
    /// Accepts callbacks that do not name an attempt.
    open: bool,
    tx: oneshot::Sender<bool>,
}

impl Slot {
    fn accepts(&self, attempt_id: Option<Uuid>) -> bool {
        match attempt_id {
            Some(id) => id == self.attempt_id,
            None => self.open,
        }
    }
}

#[derive(Default)]
struct HubInner {
    next_token: u64,
    slots: HashMap<String, Slot>,
}

#[derive(Clone, Default)]
pub struct CallbackHub {
    inner: Arc<Mutex<HubInner>>,
}

fn lock(inner: &Mutex<HubInner>) -> MutexGuard<'_, HubInner> {
    // Nothing inside the critical sections can panic halfway through an update.
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl CallbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `attempt_id` under `key`. Any older slot for the
    /// same key is superseded; its waiter observes a timeout.
    pub fn arm(&self, key: &str, attempt_id: Uuid) -> CallbackWait {
        let (tx, rx) = oneshot::channel();
        let mut inner = lock(&self.inner);
        inner.next_token += 1;
        let token = inner.next_token;
        let slot = Slot {
            token,
            attempt_id,
            open: false,
            tx,
        };
        if inner.slots.insert(key.to_string(), slot).is_some() {
            warn!(key, "callback: superseded an armed wait");
        }
        debug!(key, token, attempt_id = %attempt_id, "callback: armed");
        CallbackWait {
            hub: self.inner.clone(),
            key: key.to_string(),
            token,
            rx: Some(rx),
        }
    }

    /// Resolve the outstanding wait for `key`, if the callback belongs to it.
    /// `attempt_id` is `None` for callbacks that do not name their attempt;
    /// those are only accepted once the wait has been opened.
    pub fn deliver(&self, key: &str, attempt_id: Option<Uuid>, success: bool) -> Delivery {
        let mut inner = lock(&self.inner);
        let accepts = match inner.slots.get(key) {
            Some(slot) => slot.accepts(attempt_id),
            None => {
                warn!(key, success, "callback: dropping callback with no outstanding wait");
                return Delivery::NoWaiter;
            }
        };
        if !accepts {
            warn!(
                key,
                success,
                attempt_id = ?attempt_id,
                "callback: dropping callback for another attempt"
            );
            return Delivery::Stale;
        }
        let Some(slot) = inner.slots.remove(key) else {
            return Delivery::NoWaiter;
        };
        // Send under the lock so a waiter that lost the slot can rely on the
        // value already being in its channel.
        match slot.tx.send(success) {
            Ok(()) => {
                debug!(key, success, "callback: delivered");
                Delivery::Resolved
            }
            Err(_) => {
                warn!(key, "callback: waiter went away before delivery");
                Delivery::NoWaiter
            }
        }
    }

    pub fn is_waiting(&self, key: &str) -> bool {
        lock(&self.inner).slots.contains_key(key)
    }

    pub fn waiting_count(&self) -> usize {
        lock(&self.inner).slots.len()
    }
}

// ---------------------------------------------------------------------------
// CallbackWait
// ---------------------------------------------------------------------------

/// An armed wait. Dropping it, awaited or not, disarms the slot.
pub struct CallbackWait {
    hub: Arc<Mutex<HubInner>>,
    key: String,
    token: u64,
    rx: Option<oneshot::Receiver<bool>>,
}

impl CallbackWait {
    /// Start accepting callbacks that do not name an attempt.
    pub fn open(&self) {
        let mut inner = lock(&self.hub);
        if let Some(slot) = inner.slots.get_mut(&self.key) {
            if slot.token == self.token {
                slot.open = true;
            }
        }
    }

    /// Suspend until a callback is delivered or `deadline` passes. A deadline
    /// already in the past still lets a callback that arrived earlier win.
    pub async fn wait_until(mut self, deadline: DateTime<Utc>) -> WaitOutcome {
        let Some(mut rx) = self.rx.take() else {
            return WaitOutcome::TimedOut;
        };
        let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();

        match tokio::time::timeout(remaining, &mut rx).await {
            Ok(Ok(success)) => WaitOutcome::Delivered { success },
            Ok(Err(_)) => {
                // Sender dropped without a value: the slot was superseded.
                WaitOutcome::TimedOut
            }
            Err(_) => {
                if self.claim() {
                    WaitOutcome::TimedOut
                } else {
                    match rx.try_recv() {
                        Ok(success) => WaitOutcome::Delivered { success },
                        Err(_) => WaitOutcome::TimedOut,
                    }
                }
            }
        }
    }

    /// Remove our slot if it is still ours. Returns whether we removed it.
    fn claim(&self) -> bool {
        let mut inner = lock(&self.hub);
        let ours = inner
            .slots
            .get(&self.key)
            .is_some_and(|slot| slot.token == self.token);
        if ours {
            inner.slots.remove(&self.key);
        }
        ours
    }
}

impl Drop for CallbackWait {
    fn drop(&mut self) {
        // Token-checked, so this never touches a newer slot for the key.
        self.claim();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
