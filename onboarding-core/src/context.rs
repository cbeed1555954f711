//! Per-execution state threaded through the orchestrator and the patterns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::activities::Activities;
use crate::backend::OnboardingBackend;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{OnboardingError, Result};
use crate::platform::ActivityRegistry;
use crate::signal::{AwaitKind, SignalRouter, SlotGuard};
use crate::types::{NewRequest, RequestType, StatusUpdate, StepStatus};

/// Shared services every execution needs.
#[derive(Clone)]
pub struct Dependencies {
    pub activities: Arc<Activities>,
    pub registry: Arc<ActivityRegistry>,
    pub signals: SignalRouter,
    pub config: Arc<EngineConfig>,
}

impl Dependencies {
    pub fn new(backend: Arc<dyn OnboardingBackend>, config: EngineConfig) -> Self {
        Self::with_registry(backend, config, ActivityRegistry::with_builtins())
    }

    pub fn with_registry(
        backend: Arc<dyn OnboardingBackend>,
        config: EngineConfig,
        registry: ActivityRegistry,
    ) -> Self {
        Self {
            activities: Arc::new(Activities::new(backend, config.activity_options())),
            registry: Arc::new(registry),
            signals: SignalRouter::new(),
            config: Arc::new(config),
        }
    }
}

/// Last status this run wrote for each step.
#[derive(Clone, Default)]
pub struct StatusLedger {
    inner: Arc<Mutex<HashMap<String, StepStatus>>>,
}

impl StatusLedger {
    fn record(&self, step_slug: &str, status: StepStatus) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step_slug.to_string(), status);
    }

    pub fn last(&self, step_slug: &str) -> Option<StepStatus> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_slug)
            .copied()
    }
}

pub struct ExecutionContext {
    execution_id: String,
    game_id: Uuid,
    deps: Dependencies,
    slot: SlotGuard,
    cancel: CancelToken,
    ledger: StatusLedger,
}

impl ExecutionContext {
    /// Register a top-level execution. Fails when the id is already live.
    pub fn root(
        deps: Dependencies,
        execution_id: impl Into<String>,
        game_id: Uuid,
        cancel: CancelToken,
    ) -> Result<Self> {
        let execution_id = execution_id.into();
        let slot = deps.signals.register(&execution_id, game_id)?;
        Ok(Self {
            execution_id,
            game_id,
            deps,
            slot,
            cancel,
            ledger: StatusLedger::default(),
        })
    }

    /// Register a child execution sharing this one's cancellation and ledger.
    pub fn child(&self, execution_id: impl Into<String>) -> Result<Self> {
        let execution_id = execution_id.into();
        let slot = self.deps.signals.register(&execution_id, self.game_id)?;
        Ok(Self {
            execution_id,
            game_id: self.game_id,
            deps: self.deps.clone(),
            slot,
            cancel: self.cancel.clone(),
            ledger: self.ledger.clone(),
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn game_id(&self) -> Uuid {
        self.game_id
    }

    pub fn activities(&self) -> &Activities {
        &self.deps.activities
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.deps.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.deps.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    // ── Status writes ──

    pub async fn set_status(
        &self,
        step_slug: &str,
        status: StepStatus,
        result: Option<Value>,
    ) -> Result<()> {
        self.write_status(&self.cancel, step_slug, status, result)
            .await
    }

    /// Status write that ignores cancellation. Used by the cleanup sweep.
    pub async fn set_status_detached(
        &self,
        step_slug: &str,
        status: StepStatus,
        result: Option<Value>,
    ) -> Result<()> {
        self.write_status(&CancelToken::never(), step_slug, status, result)
            .await
    }

    async fn write_status(
        &self,
        cancel: &CancelToken,
        step_slug: &str,
        status: StepStatus,
        result: Option<Value>,
    ) -> Result<()> {
        let update = StatusUpdate {
            game_id: self.game_id,
            step_slug: step_slug.to_string(),
            status,
            result,
            workflow_id: self.execution_id.clone(),
        };
        self.activities().update_status(cancel, &update).await?;
        self.ledger.record(step_slug, status);
        tracing::info!(
            game_id = %self.game_id,
            step = step_slug,
            %status,
            execution_id = %self.execution_id,
            "step status written"
        );
        Ok(())
    }

    // ── Human gates ──

    /// Arm this execution's slot, then create the request and bind the slot to it.
    pub async fn raise_request(
        &self,
        step_slug: &str,
        request_type: RequestType,
        config: Value,
    ) -> Result<Uuid> {
        self.slot.arm(AwaitKind::from(request_type), step_slug);
        let request = NewRequest {
            game_id: self.game_id,
            step_slug: step_slug.to_string(),
            workflow_id: self.execution_id.clone(),
            request_type,
            config,
        };
        match self.activities().create_request(&self.cancel, &request).await {
            Ok(request_id) => {
                self.slot.bind(request_id.to_string());
                tracing::info!(
                    game_id = %self.game_id,
                    step = step_slug,
                    %request_type,
                    %request_id,
                    "human request raised"
                );
                Ok(request_id)
            }
            Err(e) => {
                self.slot.disarm();
                Err(e)
            }
        }
    }

    /// Arm the slot without creating anything, for gates whose request is
    /// raised by an activity. Pair with [`ExecutionContext::bind_awaited`]
    /// or [`ExecutionContext::disarm`].
    pub fn arm(&self, kind: AwaitKind, step_slug: &str) {
        self.slot.arm(kind, step_slug);
    }

    pub fn bind_awaited(&self, request_id: impl Into<String>) {
        self.slot.bind(request_id);
    }

    pub fn disarm(&self) {
        self.slot.disarm();
    }

    /// Wait for the human response to the armed request and decode it as `T`.
    ///
    /// Payloads that do not decode are logged and the wait continues. Without
    /// a configured gate timeout the wait is unbounded.
    pub async fn await_response<T: DeserializeOwned>(&self, gate: &str) -> Result<T> {
        let started = tokio::time::Instant::now();
        let gate_timeout = self.config().human_gate_timeout.map(|d| d.get());
        let reminder = self.config().human_reminder_interval.map(|d| d.get());

        loop {
            let remaining = gate_timeout.map(|t| t.saturating_sub(started.elapsed()));
            let wait = match (remaining, reminder) {
                (Some(r), Some(i)) => Some(r.min(i)),
                (r, i) => r.or(i),
            };

            match self.slot.recv(&self.cancel, wait).await? {
                Some(signal) => match serde_json::from_value::<T>(signal.payload) {
                    Ok(response) => {
                        self.slot.disarm();
                        return Ok(response);
                    }
                    Err(e) => {
                        tracing::warn!(
                            execution_id = %self.execution_id,
                            gate,
                            error = %e,
                            "malformed human response ignored, still waiting"
                        );
                    }
                },
                None => {
                    if let Some(timeout) = gate_timeout {
                        if started.elapsed() >= timeout {
                            self.slot.disarm();
                            return Err(OnboardingError::HumanGateTimeout {
                                gate: gate.to_string(),
                                timeout,
                            });
                        }
                    }
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        gate,
                        waited = ?started.elapsed(),
                        "still waiting for human response"
                    );
                }
            }
        }
    }

    // ── Job callbacks ──

    pub fn arm_callback(&self, step_slug: &str) {
        self.slot.arm(AwaitKind::JobCallback, step_slug);
    }

    /// Wait for the job's completion signal. `Ok(None)` when `timeout` elapses.
    pub async fn await_callback(&self, timeout: Duration) -> Result<Option<Value>> {
        let received = self.slot.recv(&self.cancel, Some(timeout)).await;
        self.slot.disarm();
        Ok(received?.map(|signal| signal.payload))
    }
}
