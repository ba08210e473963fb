//! Retry / timeout / callback orchestration engine.
//!
//! One tokio task drives each instance through the loop below, holding the
//! instance's exclusive guard for the whole run:
//!
//! ```text
//! StartAttempt ─► AddAttempt ─► Dispatch ──┬─ accepted ─► AwaitCallback ─┐
//!      ▲                                   └─ rejected ──────────────────┤
//!      │                                                                 ▼
//!      └──────────────────────── retry ◄──────────────────────────── Evaluate ──► Completed
//! ```
//!
//! The current `Step` is checkpointed before every suspend point so a
//! restarted process can pick the run up where it stopped. The attempt id is
//! checkpointed before its record is added, so a resumed run never counts an
//! attempt twice. Dispatch is at-least-once across restarts; ledger writes
//! are absolute sets.

pub mod locks;

pub use locks::{InstanceGuard, InstanceLocks};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attempt::{AttemptCounters, AttemptState, OrchestrationState};
use crate::callback::{CallbackHub, CallbackWait, Delivery, WaitOutcome};
use crate::checkpoint::{Checkpoint, RunInput, RunSummary, Step};
use crate::config::Config;
use crate::dispatch::{self, DispatchRequest, RequestDispatcher, INSTANCE_ID_TOKEN};
use crate::error::{Result, RtcError};
use crate::retry::should_retry;
use crate::store::AttemptStore;

pub const STARTED_OVERALL_STATE: &str = "Orchestration started";

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub timeout_limit: Duration,
    pub error_likelihood_percentage: u8,
    pub public_base_url: String,
    pub callback_url_template: String,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.ensure_valid()?;
        let cfg = Self {
            max_attempts: config.orchestration.max_attempts,
            timeout_limit: Duration::from_secs(config.orchestration.timeout_limit_seconds),
            error_likelihood_percentage: config.orchestration.error_response_likelihood_percentage,
            public_base_url: config.server.public_base_url.clone(),
            callback_url_template: config.server.callback_url_template.clone(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RtcError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.timeout_limit.is_zero() {
            return Err(RtcError::InvalidConfig(
                "timeout limit must be greater than 0".into(),
            ));
        }
        if chrono::Duration::from_std(self.timeout_limit).is_err() {
            return Err(RtcError::InvalidConfig(format!(
                "timeout limit {:?} is out of range",
                self.timeout_limit
            )));
        }
        if self.error_likelihood_percentage > 100 {
            return Err(RtcError::InvalidConfig(format!(
                "error likelihood {}% is not a percentage",
                self.error_likelihood_percentage
            )));
        }
        if !self.callback_url_template.contains(INSTANCE_ID_TOKEN) {
            return Err(RtcError::InvalidConfig(format!(
                "callback url template must contain {INSTANCE_ID_TOKEN}"
            )));
        }
        Ok(())
    }

    pub fn callback_uri(&self, instance_id: &str) -> String {
        dispatch::callback_uri(
            &self.callback_url_template,
            &self.public_base_url,
            instance_id,
        )
    }

    fn run_input(&self, instance_id: &str) -> RunInput {
        RunInput {
            max_attempts: self.max_attempts,
            timeout_limit: self.timeout_limit,
            error_likelihood_percentage: self.error_likelihood_percentage,
            callback_uri: self.callback_uri(instance_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

pub struct StartedRun {
    pub instance_id: String,
    pub callback_uri: String,
    pub handle: JoinHandle<Result<RunSummary>>,
}

/// Read-only view served by the status query.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub state: OrchestrationState,
    pub counters: AttemptCounters,
    pub step: Option<Step>,
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<dyn AttemptStore>,
    dispatcher: Arc<dyn RequestDispatcher>,
    hub: CallbackHub,
    locks: InstanceLocks,
    config: EngineConfig,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        dispatcher: Arc<dyn RequestDispatcher>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::with_hub(store, dispatcher, CallbackHub::new(), config)
    }

    /// Like `new`, sharing an existing hub with whoever delivers callbacks.
    pub fn with_hub(
        store: Arc<dyn AttemptStore>,
        dispatcher: Arc<dyn RequestDispatcher>,
        hub: CallbackHub,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                hub,
                locks: InstanceLocks::new(),
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &CallbackHub {
        &self.inner.hub
    }

    pub fn store(&self) -> Arc<dyn AttemptStore> {
        self.inner.store.clone()
    }

    /// Run `f` against the store on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AttemptStore) -> Result<T> + Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| RtcError::Store(format!("task join error: {e}")))?
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a new instance and spawn its run. Returns as soon as the
    /// instance is recorded; the outcome shows up in the status query.
    pub async fn start(&self) -> Result<StartedRun> {
        self.start_with_id(Uuid::new_v4().to_string()).await
    }

    pub async fn start_with_id(&self, instance_id: impl Into<String>) -> Result<StartedRun> {
        let instance_id = instance_id.into();
        let input = self.inner.config.run_input(&instance_id);
        let callback_uri = input.callback_uri.clone();
        let checkpoint = Checkpoint::new(instance_id.clone(), input);

        let id = instance_id.clone();
        self.with_store(move |s| {
            if s.get_checkpoint(&id)?.is_some() || s.get(&id)?.is_some() {
                return Err(RtcError::InstanceExists(id));
            }
            s.update_overall_state(&id, STARTED_OVERALL_STATE)?;
            s.put_checkpoint(&checkpoint)
        })
        .await?;

        info!(instance_id = %instance_id, "engine: orchestration started");
        let handle = self.spawn_run(instance_id.clone());
        Ok(StartedRun {
            instance_id,
            callback_uri,
            handle,
        })
    }

    fn spawn_run(&self, instance_id: String) -> JoinHandle<Result<RunSummary>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(&instance_id).await })
    }

    /// Spawn a run for every checkpoint left unfinished by a previous process.
    pub async fn resume_pending(&self) -> Result<Vec<JoinHandle<Result<RunSummary>>>> {
        let pending = self.with_store(|s| s.pending_checkpoints()).await?;
        let mut handles = Vec::with_capacity(pending.len());
        for cp in pending {
            info!(
                instance_id = %cp.instance_id,
                step = cp.step.as_str(),
                "engine: resuming orchestration"
            );
            handles.push(self.spawn_run(cp.instance_id));
        }
        Ok(handles)
    }

    /// Drive `instance_id` from its checkpoint to completion under the
    /// instance's exclusive guard.
    pub async fn run(&self, instance_id: &str) -> Result<RunSummary> {
        let _guard = self.inner.locks.lock(instance_id).await;
        let id = instance_id.to_string();
        let mut checkpoint = self
            .with_store(move |s| s.get_checkpoint(&id))
            .await?
            .ok_or_else(|| RtcError::InstanceNotFound(instance_id.to_string()))?;

        match self.drive(&mut checkpoint).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                if !checkpoint.step.is_terminal() {
                    self.record_fault(&mut checkpoint, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn record_fault(&self, checkpoint: &mut Checkpoint, err: &RtcError) {
        error!(
            instance_id = %checkpoint.instance_id,
            step = checkpoint.step.as_str(),
            error = %err,
            "engine: orchestration faulted"
        );
        checkpoint.advance(Step::Faulted {
            error: err.to_string(),
        });
        let cp = checkpoint.clone();
        let text = format!("Faulted: {err}");
        let written = self
            .with_store(move |s| {
                s.put_checkpoint(&cp)?;
                s.update_overall_state(&cp.instance_id, &text)
            })
            .await;
        if let Err(e) = written {
            error!(
                instance_id = %checkpoint.instance_id,
                error = %e,
                "engine: could not persist fault"
            );
        }
    }

    async fn checkpoint(&self, checkpoint: &mut Checkpoint, step: Step) -> Result<()> {
        checkpoint.advance(step);
        let cp = checkpoint.clone();
        self.with_store(move |s| s.put_checkpoint(&cp)).await
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    async fn drive(&self, cp: &mut Checkpoint) -> Result<RunSummary> {
        let instance_id = cp.instance_id.clone();
        loop {
            match cp.step.clone() {
                Step::StartAttempt => {
                    // A record still in `New` was added by a run that stopped
                    // before checkpointing its dispatch; reuse it.
                    let id = instance_id.clone();
                    let orphan = self
                        .with_store(move |s| {
                            Ok(s.get(&id)?.and_then(|st| {
                                st.latest_attempt()
                                    .filter(|a| a.state == AttemptState::New)
                                    .map(|a| a.id)
                            }))
                        })
                        .await?;
                    let attempt_id = orphan.unwrap_or_else(Uuid::new_v4);
                    self.checkpoint(cp, Step::AddAttempt { attempt_id }).await?;
                }
                Step::AddAttempt { attempt_id } => {
                    let max = cp.input.max_attempts;
                    let id = instance_id.clone();
                    let number = self
                        .with_store(move |s| {
                            let exists = s
                                .get(&id)?
                                .is_some_and(|st| st.attempt(&attempt_id).is_some());
                            if !exists {
                                s.add_attempt(&id, attempt_id)?;
                            }
                            let n = s.get(&id)?.map(|st| st.attempts.len()).unwrap_or(0);
                            s.update_overall_state(&id, &format!("Attempt {n} of {max} in progress"))?;
                            Ok(n)
                        })
                        .await?;
                    info!(
                        instance_id = %instance_id,
                        attempt_id = %attempt_id,
                        attempt = number,
                        max_attempts = max,
                        "engine: attempt started"
                    );
                    self.checkpoint(cp, Step::Dispatch { attempt_id }).await?;
                }
                Step::Dispatch { attempt_id } => {
                    self.dispatch_attempt(cp, attempt_id).await?;
                    self.checkpoint(cp, Step::Evaluate).await?;
                }
                Step::AwaitCallback {
                    attempt_id,
                    deadline,
                } => {
                    // Resumed after a restart: the original wait died with
                    // the old process, so re-arm for what is left of the
                    // deadline.
                    let wait = self.inner.hub.arm(&instance_id, attempt_id);
                    wait.open();
                    self.await_callback(&instance_id, attempt_id, wait, deadline)
                        .await?;
                    self.checkpoint(cp, Step::Evaluate).await?;
                }
                Step::Evaluate => {
                    let id = instance_id.clone();
                    let state = self
                        .with_store(move |s| s.get(&id))
                        .await?
                        .ok_or_else(|| RtcError::InstanceNotFound(instance_id.clone()))?;
                    let latest = state.latest_attempt().ok_or_else(|| {
                        RtcError::Store(format!(
                            "instance '{instance_id}' has no attempts to evaluate"
                        ))
                    })?;
                    let count = state.attempts.len();

                    if should_retry(count, latest.is_success, cp.input.max_attempts) {
                        info!(
                            instance_id = %instance_id,
                            attempts = count,
                            last_state = %latest.state,
                            "engine: retrying"
                        );
                        self.checkpoint(cp, Step::StartAttempt).await?;
                        continue;
                    }

                    let summary = RunSummary {
                        instance_id: instance_id.clone(),
                        attempts: count,
                        final_state: Some(latest.state),
                        message: latest.message.clone(),
                        succeeded: latest.is_success,
                    };
                    let id = instance_id.clone();
                    let text = summary_text(&summary);
                    self.with_store(move |s| s.update_overall_state(&id, &text))
                        .await?;
                    self.checkpoint(
                        cp,
                        Step::Completed {
                            summary: summary.clone(),
                        },
                    )
                    .await?;
                    info!(
                        instance_id = %instance_id,
                        attempts = summary.attempts,
                        succeeded = summary.succeeded,
                        "engine: orchestration completed"
                    );
                    return Ok(summary);
                }
                Step::Completed { summary } => return Ok(summary),
                Step::Faulted { error } => {
                    return Err(RtcError::Faulted {
                        instance_id,
                        reason: error,
                    })
                }
            }
        }
    }

    /// Execute one attempt: dispatch, then wait for the callback when the
    /// external service accepted the request.
    async fn dispatch_attempt(&self, cp: &mut Checkpoint, attempt_id: Uuid) -> Result<()> {
        let instance_id = cp.instance_id.clone();
        self.transition(&instance_id, attempt_id, AttemptState::Executing, None)
            .await?;

        // Armed before dispatching so a callback that beats the dispatch
        // response is not lost. Until opened it only takes callbacks tagged
        // with this attempt. Dropping `wait` disarms it.
        let wait = self.inner.hub.arm(&instance_id, attempt_id);
        let request = DispatchRequest {
            attempt_id,
            callback_uri: dispatch::attempt_callback_uri(&cp.input.callback_uri, attempt_id),
            error_likelihood_percentage: cp.input.error_likelihood_percentage,
        };

        let failure = match self.inner.dispatcher.dispatch(&request).await {
            Ok(outcome) if outcome.is_success() => {
                wait.open();
                let deadline = Utc::now() + timeout_delta(cp.input.timeout_limit)?;
                let message = format!("Dispatch accepted: {} {}", outcome.status, outcome.reason);
                self.transition(
                    &instance_id,
                    attempt_id,
                    AttemptState::ExecutedSuccess,
                    Some(message),
                )
                .await?;
                let id = instance_id.clone();
                self.with_store(move |s| {
                    s.update_attempt_state(&id, attempt_id, AttemptState::WaitingForCallback)?;
                    s.update_attempt_timeout_due(&id, attempt_id, deadline)
                })
                .await?;
                self.checkpoint(
                    cp,
                    Step::AwaitCallback {
                        attempt_id,
                        deadline,
                    },
                )
                .await?;
                self.await_callback(&instance_id, attempt_id, wait, deadline)
                    .await?;
                return Ok(());
            }
            Ok(outcome) => format!("Dispatch failed: {} {}", outcome.status, outcome.reason),
            Err(e) => format!("Dispatch error: {e}"),
        };

        drop(wait);
        warn!(
            instance_id = %instance_id,
            attempt_id = %attempt_id,
            reason = %failure,
            "engine: dispatch failed"
        );
        self.transition(
            &instance_id,
            attempt_id,
            AttemptState::ExecutedFailed,
            Some(failure),
        )
        .await
    }

    async fn await_callback(
        &self,
        instance_id: &str,
        attempt_id: Uuid,
        wait: CallbackWait,
        deadline: DateTime<Utc>,
    ) -> Result<WaitOutcome> {
        info!(
            instance_id,
            attempt_id = %attempt_id,
            deadline = %deadline.to_rfc3339(),
            "engine: waiting for callback"
        );
        let outcome = wait.wait_until(deadline).await;
        let (state, message) = match outcome {
            WaitOutcome::Delivered { success: true } => (
                AttemptState::CallbackSuccess,
                "Callback received: success".to_string(),
            ),
            WaitOutcome::Delivered { success: false } => (
                AttemptState::CallbackFailure,
                "Callback received: failure".to_string(),
            ),
            WaitOutcome::TimedOut => (
                AttemptState::TimedOut,
                format!("No callback received before {}", deadline.to_rfc3339()),
            ),
        };
        if state.is_success() {
            info!(instance_id, attempt_id = %attempt_id, state = %state, "engine: callback resolved");
        } else {
            warn!(instance_id, attempt_id = %attempt_id, state = %state, "engine: callback resolved");
        }
        self.transition(instance_id, attempt_id, state, Some(message))
            .await?;
        Ok(outcome)
    }

    async fn transition(
        &self,
        instance_id: &str,
        attempt_id: Uuid,
        state: AttemptState,
        message: Option<String>,
    ) -> Result<()> {
        let id = instance_id.to_string();
        self.with_store(move |s| {
            s.update_attempt_state(&id, attempt_id, state)?;
            if let Some(message) = message {
                s.update_attempt_message(&id, attempt_id, &message)?;
            }
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Callbacks, queries and management
    // -----------------------------------------------------------------------

    /// Hand an external callback to the waiting run, if it belongs to the
    /// attempt being waited on. `attempt_id` comes from the callback URI's
    /// `attempt` query parameter; callbacks without one only count once the
    /// current attempt's dispatch was accepted.
    pub fn deliver_callback(
        &self,
        instance_id: &str,
        attempt_id: Option<Uuid>,
        success: bool,
    ) -> Delivery {
        let delivery = self.inner.hub.deliver(instance_id, attempt_id, success);
        info!(
            instance_id,
            attempt_id = ?attempt_id,
            success,
            delivery = ?delivery,
            "engine: callback received"
        );
        delivery
    }

    pub async fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let id = instance_id.to_string();
        let (state, checkpoint) = self
            .with_store(move |s| Ok((s.get(&id)?, s.get_checkpoint(&id)?)))
            .await?;
        let state = state.ok_or_else(|| RtcError::InstanceNotFound(instance_id.to_string()))?;
        Ok(InstanceStatus {
            counters: state.counters(),
            state,
            step: checkpoint.map(|cp| cp.step),
            running: self.inner.locks.is_locked(instance_id),
        })
    }

    pub async fn list_instances(&self) -> Result<Vec<String>> {
        self.with_store(|s| s.list_instances()).await
    }

    /// Clear the attempt ledger. Refused while a run holds the instance.
    pub async fn reset(&self, instance_id: &str) -> Result<()> {
        let _guard = self.inner.locks.try_lock(instance_id)?;
        let id = instance_id.to_string();
        self.with_store(move |s| {
            if s.get(&id)?.is_none() {
                return Err(RtcError::InstanceNotFound(id));
            }
            s.reset(&id)
        })
        .await?;
        info!(instance_id, "engine: instance reset");
        Ok(())
    }

    /// Remove the instance record and checkpoint. Refused while a run holds
    /// the instance.
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        let _guard = self.inner.locks.try_lock(instance_id)?;
        let id = instance_id.to_string();
        let removed = self.with_store(move |s| s.delete(&id)).await?;
        if !removed {
            return Err(RtcError::InstanceNotFound(instance_id.to_string()));
        }
        info!(instance_id, "engine: instance deleted");
        Ok(())
    }
}

fn timeout_delta(limit: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(limit).map_err(|e| RtcError::InvalidConfig(e.to_string()))
}

fn summary_text(summary: &RunSummary) -> String {
    let last = summary
        .final_state
        .map(|s| s.as_str())
        .unwrap_or("none");
    if summary.succeeded {
        format!(
            "Completed successfully after {} attempt(s)",
            summary.attempts
        )
    } else {
        format!(
            "Failed after {} attempt(s); last attempt {}: {}",
            summary.attempts, last, summary.message
        )
    }
}
