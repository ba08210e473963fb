//! Resumable continuation for one orchestration run.
//!
//! The engine writes a `Checkpoint` before every suspend point. After a
//! restart, every checkpoint whose `Step` is not terminal is picked up again
//! by `Engine::resume_pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use uuid::Uuid;

use crate::attempt::AttemptState;

// ---------------------------------------------------------------------------
// RunInput
// ---------------------------------------------------------------------------

/// Policy snapshot taken when the run starts. A resumed run keeps using it
/// even if the deployment config changed in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub max_attempts: u32,
    #[serde(
        rename = "timeout_limit_ms",
        serialize_with = "serialize_duration_ms",
        deserialize_with = "deserialize_duration_ms"
    )]
    pub timeout_limit: Duration,
    pub error_likelihood_percentage: u8,
    pub callback_uri: String,
}

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// Completion result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub instance_id: String,
    pub attempts: usize,
    pub final_state: Option<AttemptState>,
    pub message: String,
    pub succeeded: bool,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// Next thing the engine has to do for an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    StartAttempt,
    /// Attempt id chosen and persisted; the ledger record may or may not
    /// exist yet.
    AddAttempt {
        attempt_id: Uuid,
    },
    Dispatch {
        attempt_id: Uuid,
    },
    AwaitCallback {
        attempt_id: Uuid,
        deadline: DateTime<Utc>,
    },
    Evaluate,
    Completed {
        summary: RunSummary,
    },
    Faulted {
        error: String,
    },
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Faulted { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartAttempt => "start_attempt",
            Self::AddAttempt { .. } => "add_attempt",
            Self::Dispatch { .. } => "dispatch",
            Self::AwaitCallback { .. } => "await_callback",
            Self::Evaluate => "evaluate",
            Self::Completed { .. } => "completed",
            Self::Faulted { .. } => "faulted",
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub instance_id: String,
    pub input: RunInput,
    pub step: Step,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(instance_id: impl Into<String>, input: RunInput) -> Self {
        Self {
            instance_id: instance_id.into(),
            input,
            step: Step::StartAttempt,
            updated_at: Utc::now(),
        }
    }

    /// Move to `step`, stamping `updated_at`.
    pub fn advance(&mut self, step: Step) {
        self.step = step;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as milliseconds: u64)
// ---------------------------------------------------------------------------

fn serialize_duration_ms<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(d.as_millis() as u64)
}

fn deserialize_duration_ms<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = u64::deserialize(d)?;
    Ok(Duration::from_millis(ms))
}
