//! Onboarding engine: one instance per game.
//!
//! Starting a game spawns its orchestrator on the runtime under the
//! deterministic workflow id. A second start while the first is still
//! running is rejected. Finished instances stay visible until the next start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::backend::OnboardingBackend;
use crate::cancel::{cancel_pair, CancelHandle};
use crate::config::EngineConfig;
use crate::context::{Dependencies, ExecutionContext};
use crate::error::{OnboardingError, Result};
use crate::ids;
use crate::orchestrator::{run_onboarding, RunSummary};
use crate::signal::{AwaitedSignal, Delivery, Signal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Completed { summary: RunSummary },
    Failed { error: String },
    Cancelled,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveExecution {
    pub execution_id: String,
    pub awaiting: Option<AwaitedSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub game_id: Uuid,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub state: InstanceState,
    pub executions: Vec<LiveExecution>,
}

struct Instance {
    workflow_id: String,
    started_at: DateTime<Utc>,
    cancel: CancelHandle,
    state: watch::Receiver<InstanceState>,
}

pub struct OnboardingEngine {
    deps: Dependencies,
    instances: Mutex<HashMap<Uuid, Instance>>,
}

impl OnboardingEngine {
    pub fn new(deps: Dependencies) -> Self {
        Self {
            deps,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_backend(backend: Arc<dyn OnboardingBackend>, config: EngineConfig) -> Self {
        Self::new(Dependencies::new(backend, config))
    }

    pub fn dependencies(&self) -> &Dependencies {
        &self.deps
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<Uuid, Instance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start onboarding for a game and return its workflow id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, game_id: Uuid, game_name: &str) -> Result<String> {
        let mut instances = self.instances();
        if let Some(existing) = instances.get(&game_id) {
            if !existing.state.borrow().is_terminal() {
                return Err(OnboardingError::AlreadyRunning {
                    game_id,
                    workflow_id: existing.workflow_id.clone(),
                });
            }
        }

        let workflow_id = ids::onboarding_id(game_name, game_id);
        let (cancel, token) = cancel_pair();
        let ctx = ExecutionContext::root(self.deps.clone(), workflow_id.clone(), game_id, token)?;
        let (state_tx, state_rx) = watch::channel(InstanceState::Running);

        tokio::spawn(async move {
            let state = match run_onboarding(&ctx).await {
                Ok(summary) => InstanceState::Completed { summary },
                Err(OnboardingError::Cancelled) => InstanceState::Cancelled,
                Err(e) => {
                    tracing::error!(game_id = %ctx.game_id(), error = %e, "onboarding failed");
                    InstanceState::Failed {
                        error: e.to_string(),
                    }
                }
            };
            tracing::info!(
                game_id = %ctx.game_id(),
                workflow_id = ctx.execution_id(),
                state = state.as_str(),
                "onboarding instance finished"
            );
            drop(ctx);
            state_tx.send_replace(state);
        });

        tracing::info!(%game_id, workflow_id = %workflow_id, "onboarding started");
        instances.insert(
            game_id,
            Instance {
                workflow_id: workflow_id.clone(),
                started_at: Utc::now(),
                cancel,
                state: state_rx,
            },
        );
        Ok(workflow_id)
    }

    /// Request cancellation of a running instance. Returns its workflow id.
    pub fn cancel(&self, game_id: Uuid) -> Result<String> {
        let instances = self.instances();
        let instance = instances
            .get(&game_id)
            .ok_or(OnboardingError::InstanceNotFound(game_id))?;
        if instance.state.borrow().is_terminal() {
            tracing::info!(%game_id, "cancel requested for finished instance");
        } else {
            tracing::warn!(%game_id, workflow_id = %instance.workflow_id, "cancellation requested");
            instance.cancel.cancel();
        }
        Ok(instance.workflow_id.clone())
    }

    /// Route a signal to a live execution (main or child).
    pub fn signal(&self, execution_id: &str, signal: Signal) -> Result<Delivery> {
        self.deps.signals.deliver(execution_id, signal)
    }

    pub fn status(&self, game_id: Uuid) -> Option<InstanceStatus> {
        let instances = self.instances();
        let instance = instances.get(&game_id)?;
        let executions = self
            .deps
            .signals
            .executions_for_game(game_id)
            .into_iter()
            .map(|(execution_id, awaiting)| LiveExecution {
                execution_id,
                awaiting,
            })
            .collect();
        let state = instance.state.borrow().clone();
        let status = InstanceStatus {
            game_id,
            workflow_id: instance.workflow_id.clone(),
            started_at: instance.started_at,
            state,
            executions,
        };
        Some(status)
    }

    /// Wait until the game's current instance reaches a terminal state.
    pub async fn wait(&self, game_id: Uuid) -> Result<InstanceState> {
        let mut state = self
            .instances()
            .get(&game_id)
            .map(|i| i.state.clone())
            .ok_or(OnboardingError::InstanceNotFound(game_id))?;
        let finished = state
            .wait_for(InstanceState::is_terminal)
            .await
            .map_err(|_| OnboardingError::Internal(format!("instance for {game_id} vanished")))?;
        Ok(finished.clone())
    }
}
