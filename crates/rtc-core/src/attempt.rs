//! Attempt ledger data model.
//!
//! An `OrchestrationState` is the durable record of one orchestration
//! instance: every `AttemptRecord` made so far plus an advisory summary
//! string. All mutations are expressed as `StoreOp` values that carry their
//! own timestamps, so applying the same ordered sequence of ops always
//! converges to the same state no matter how often it is replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, RtcError};

pub const INITIAL_OVERALL_STATE: &str = "new";
pub const NEW_ATTEMPT_MESSAGE: &str = "New attempt";

// ---------------------------------------------------------------------------
// AttemptState
// ---------------------------------------------------------------------------

/// Lifecycle state of a single attempt.
///
/// Transitions:
/// ```text
/// New → Executing → ExecutedSuccess → WaitingForCallback → CallbackSuccess
///                 ↘ ExecutedFailed                      ↘ CallbackFailure
///                                                        ↘ TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptState {
    /// Created, no work undertaken yet.
    New,
    /// The request to the external service is in flight.
    Executing,
    /// The external service accepted the request.
    ExecutedSuccess,
    /// The external service rejected the request or was unreachable.
    ExecutedFailed,
    /// Waiting for the external service to call back.
    WaitingForCallback,
    /// The callback reported success.
    CallbackSuccess,
    /// The callback reported failure.
    CallbackFailure,
    /// No callback arrived before the deadline.
    TimedOut,
}

impl AttemptState {
    pub fn all() -> &'static [AttemptState] {
        &[
            Self::New,
            Self::Executing,
            Self::ExecutedSuccess,
            Self::ExecutedFailed,
            Self::WaitingForCallback,
            Self::CallbackSuccess,
            Self::CallbackFailure,
            Self::TimedOut,
        ]
    }

    /// `false` exactly for the three failure states.
    pub fn is_success(self) -> bool {
        !matches!(
            self,
            Self::ExecutedFailed | Self::TimedOut | Self::CallbackFailure
        )
    }

    /// No further transitions happen for this attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ExecutedFailed | Self::CallbackSuccess | Self::CallbackFailure | Self::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Executing => "Executing",
            Self::ExecutedSuccess => "ExecutedSuccess",
            Self::ExecutedFailed => "ExecutedFailed",
            Self::WaitingForCallback => "WaitingForCallback",
            Self::CallbackSuccess => "CallbackSuccess",
            Self::CallbackFailure => "CallbackFailure",
            Self::TimedOut => "TimedOut",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AttemptRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Uuid,
    /// Position in the ledger; breaks ties between equal `started_at` values.
    pub seq: u64,
    pub started_at: DateTime<Utc>,
    pub state_set_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout_due_at: Option<DateTime<Utc>>,
    pub state: AttemptState,
    pub message: String,
    pub is_success: bool,
}

impl AttemptRecord {
    fn new(id: Uuid, seq: u64, at: DateTime<Utc>) -> Self {
        Self {
            id,
            seq,
            started_at: at,
            state_set_at: at,
            timeout_due_at: None,
            state: AttemptState::New,
            message: NEW_ATTEMPT_MESSAGE.to_string(),
            is_success: false,
        }
    }

    /// Stamp the mutation time and re-derive `is_success` from `state`.
    fn touch(&mut self, at: DateTime<Utc>) {
        self.state_set_at = at;
        self.is_success = self.state.is_success();
    }
}

// ---------------------------------------------------------------------------
// StoreOp
// ---------------------------------------------------------------------------

/// One ledger mutation. Every variant sets absolute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    AddAttempt {
        attempt_id: Uuid,
        at: DateTime<Utc>,
    },
    SetAttemptState {
        attempt_id: Uuid,
        state: AttemptState,
        at: DateTime<Utc>,
    },
    SetAttemptMessage {
        attempt_id: Uuid,
        message: String,
        at: DateTime<Utc>,
    },
    SetAttemptTimeoutDue {
        attempt_id: Uuid,
        due: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    SetOverallState {
        text: String,
    },
    Reset,
}

impl StoreOp {
    pub fn add_attempt(attempt_id: Uuid) -> Self {
        Self::AddAttempt {
            attempt_id,
            at: Utc::now(),
        }
    }

    pub fn set_state(attempt_id: Uuid, state: AttemptState) -> Self {
        Self::SetAttemptState {
            attempt_id,
            state,
            at: Utc::now(),
        }
    }

    pub fn set_message(attempt_id: Uuid, message: impl Into<String>) -> Self {
        Self::SetAttemptMessage {
            attempt_id,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn set_timeout_due(attempt_id: Uuid, due: DateTime<Utc>) -> Self {
        Self::SetAttemptTimeoutDue {
            attempt_id,
            due,
            at: Utc::now(),
        }
    }

    pub fn set_overall_state(text: impl Into<String>) -> Self {
        Self::SetOverallState { text: text.into() }
    }
}

// ---------------------------------------------------------------------------
// AttemptCounters
// ---------------------------------------------------------------------------

/// Aggregate counts derived from the ledger. Never stored, so replaying the
/// ledger can not double count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounters {
    pub attempts: usize,
    pub timeouts: usize,
    pub errors: usize,
    pub callback_failures: usize,
    pub succeeded: usize,
}

// ---------------------------------------------------------------------------
// OrchestrationState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub instance_id: String,
    #[serde(default)]
    pub attempts: BTreeMap<Uuid, AttemptRecord>,
    #[serde(default = "default_overall_state")]
    pub overall_state: String,
}

fn default_overall_state() -> String {
    INITIAL_OVERALL_STATE.to_string()
}

impl OrchestrationState {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            attempts: BTreeMap::new(),
            overall_state: default_overall_state(),
        }
    }

    /// Rebuild a state from scratch by applying `ops` in order.
    pub fn replay<'a>(
        instance_id: impl Into<String>,
        ops: impl IntoIterator<Item = &'a StoreOp>,
    ) -> Result<Self> {
        let mut state = Self::new(instance_id);
        for op in ops {
            state.apply(op)?;
        }
        Ok(state)
    }

    /// Apply one mutation. On error the state is left untouched.
    pub fn apply(&mut self, op: &StoreOp) -> Result<()> {
        match op {
            StoreOp::AddAttempt { attempt_id, at } => {
                if self.attempts.contains_key(attempt_id) {
                    return Err(RtcError::DuplicateAttemptId {
                        instance_id: self.instance_id.clone(),
                        attempt_id: *attempt_id,
                    });
                }
                let seq = self.attempts.len() as u64;
                self.attempts
                    .insert(*attempt_id, AttemptRecord::new(*attempt_id, seq, *at));
            }
            StoreOp::SetAttemptState {
                attempt_id,
                state,
                at,
            } => {
                let record = self.attempt_mut(attempt_id)?;
                record.state = *state;
                record.touch(*at);
            }
            StoreOp::SetAttemptMessage {
                attempt_id,
                message,
                at,
            } => {
                let record = self.attempt_mut(attempt_id)?;
                record.message = message.clone();
                record.touch(*at);
            }
            StoreOp::SetAttemptTimeoutDue {
                attempt_id,
                due,
                at,
            } => {
                let record = self.attempt_mut(attempt_id)?;
                record.timeout_due_at = Some(*due);
                record.touch(*at);
            }
            StoreOp::SetOverallState { text } => {
                self.overall_state = text.clone();
            }
            StoreOp::Reset => {
                self.attempts.clear();
                self.overall_state = default_overall_state();
            }
        }
        Ok(())
    }

    fn attempt_mut(&mut self, attempt_id: &Uuid) -> Result<&mut AttemptRecord> {
        let instance_id = &self.instance_id;
        self.attempts
            .get_mut(attempt_id)
            .ok_or_else(|| RtcError::UnknownAttempt {
                instance_id: instance_id.clone(),
                attempt_id: *attempt_id,
            })
    }

    pub fn attempt(&self, attempt_id: &Uuid) -> Option<&AttemptRecord> {
        self.attempts.get(attempt_id)
    }

    /// The most recently started attempt.
    pub fn latest_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.values().max_by_key(|a| (a.started_at, a.seq))
    }

    /// Attempts ordered oldest first.
    pub fn attempts_chronological(&self) -> Vec<&AttemptRecord> {
        let mut list: Vec<&AttemptRecord> = self.attempts.values().collect();
        list.sort_by_key(|a| (a.started_at, a.seq));
        list
    }

    pub fn counters(&self) -> AttemptCounters {
        let mut c = AttemptCounters {
            attempts: self.attempts.len(),
            ..AttemptCounters::default()
        };
        for a in self.attempts.values() {
            match a.state {
                AttemptState::TimedOut => c.timeouts += 1,
                AttemptState::ExecutedFailed => c.errors += 1,
                AttemptState::CallbackFailure => c.callback_failures += 1,
                AttemptState::CallbackSuccess => c.succeeded += 1,
                _ => {}
            }
        }
        c
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
