use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("unknown attempt {attempt_id} for instance '{instance_id}'")]
    UnknownAttempt {
        instance_id: String,
        attempt_id: Uuid,
    },

    #[error("attempt {attempt_id} already exists for instance '{instance_id}'")]
    DuplicateAttemptId {
        instance_id: String,
        attempt_id: Uuid,
    },

    #[error("orchestration instance not found: {0}")]
    InstanceNotFound(String),

    #[error("orchestration instance already exists: {0}")]
    InstanceExists(String),

    #[error("orchestration instance '{0}' is busy: a run currently holds it")]
    InstanceBusy(String),

    #[error("orchestration instance '{instance_id}' faulted: {reason}")]
    Faulted { instance_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RtcError {
    /// Ledger integrity faults point at a logic or replay bug. They halt the
    /// orchestration instead of feeding the retry policy.
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            Self::UnknownAttempt { .. } | Self::DuplicateAttemptId { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RtcError>;
