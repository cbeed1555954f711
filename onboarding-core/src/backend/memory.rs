//! In-memory backend for tests and local runs.
//!
//! Holds the catalog, progress, requests and job triggers behind one mutex.
//! Failures can be scripted per operation, and an operation can be stalled so
//! that it never answers (which is how per-call timeouts get exercised).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use super::OnboardingBackend;
use crate::catalog::{PlanSnapshot, PlanStepRecord};
use crate::error::BackendError;
use crate::signal::Signal;
use crate::types::{
    JobExecution, JobTrigger, NewRequest, OnboardingRequest, PlatformConfig, RequestStatus,
    StatusUpdate, StepProgress, StepStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    GetPlan,
    UpdateStepStatus,
    CreateRequest,
    CancelPendingRequests,
    GetPlatformConfig,
    TriggerStep,
    TriggerExternalJob,
    PersistFormAnswers,
}

#[derive(Default)]
struct MemoryState {
    catalog: Vec<PlanStepRecord>,
    progress: HashMap<(Uuid, String), StepProgress>,
    platform_configs: HashMap<Uuid, Vec<PlatformConfig>>,
    requests: Vec<OnboardingRequest>,
    status_log: Vec<StatusUpdate>,
    jobs: Vec<(JobTrigger, JobExecution)>,
    triggered_steps: Vec<(Uuid, String)>,
    form_answers: Vec<(Uuid, String, Map<String, Value>)>,
    scripted_failures: HashMap<BackendOp, VecDeque<BackendError>>,
    stalled: HashSet<BackendOp>,
    calls: HashMap<BackendOp, u32>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    changed: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call, then either fail with a scripted error or stall forever.
    async fn enter(&self, op: BackendOp) -> Result<(), BackendError> {
        let stalled = {
            let mut state = self.lock();
            *state.calls.entry(op).or_default() += 1;
            if let Some(err) = state.scripted_failures.get_mut(&op).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            state.stalled.contains(&op)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_until<T>(&self, mut probe: impl FnMut(&MemoryState) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(found) = probe(&self.lock()) {
                return found;
            }
            notified.await;
        }
    }

    // ── Seeding ──

    pub fn add_step(&self, step: PlanStepRecord) {
        self.lock().catalog.push(step);
    }

    pub fn set_platform_config(&self, game_id: Uuid, config: PlatformConfig) {
        let mut state = self.lock();
        let configs = state.platform_configs.entry(game_id).or_default();
        configs.retain(|c| c.slug != config.slug);
        configs.push(config);
    }

    pub fn seed_status(&self, game_id: Uuid, step_slug: &str, status: StepStatus) {
        let mut progress = StepProgress::new(game_id, step_slug);
        progress.status = status;
        self.lock()
            .progress
            .insert((game_id, step_slug.to_string()), progress);
    }

    // ── Scripting ──

    /// Fail the next call of `op` with `err`. Calls queue up in order.
    pub fn fail_next(&self, op: BackendOp, err: BackendError) {
        self.lock()
            .scripted_failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn set_stalled(&self, op: BackendOp, stalled: bool) {
        let mut state = self.lock();
        if stalled {
            state.stalled.insert(op);
        } else {
            state.stalled.remove(&op);
        }
    }

    pub fn call_count(&self, op: BackendOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    // ── Inspection ──

    pub fn step_status(&self, game_id: Uuid, step_slug: &str) -> Option<StepStatus> {
        self.lock()
            .progress
            .get(&(game_id, step_slug.to_string()))
            .map(|p| p.status)
    }

    pub fn step_progress(&self, game_id: Uuid, step_slug: &str) -> Option<StepProgress> {
        self.lock()
            .progress
            .get(&(game_id, step_slug.to_string()))
            .cloned()
    }

    pub fn status_log(&self) -> Vec<StatusUpdate> {
        self.lock().status_log.clone()
    }

    pub fn requests(&self) -> Vec<OnboardingRequest> {
        self.lock().requests.clone()
    }

    pub fn jobs(&self) -> Vec<JobTrigger> {
        self.lock().jobs.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn triggered_steps(&self) -> Vec<(Uuid, String)> {
        self.lock().triggered_steps.clone()
    }

    pub fn form_answers(&self) -> Vec<(Uuid, String, Map<String, Value>)> {
        self.lock().form_answers.clone()
    }

    // ── Waiting ──

    pub async fn wait_for_request(
        &self,
        predicate: impl Fn(&OnboardingRequest) -> bool,
    ) -> OnboardingRequest {
        self.wait_until(|state| {
            state
                .requests
                .iter()
                .find(|r| r.status == RequestStatus::Pending && predicate(r))
                .cloned()
        })
        .await
    }

    /// Wait for a job trigger for `step_slug` and return it with the runner's execution.
    pub async fn wait_for_job(&self, step_slug: &str) -> (JobTrigger, JobExecution) {
        self.wait_until(|state| {
            state
                .jobs
                .iter()
                .find(|(t, _)| t.inputs.get("stepSlug").and_then(Value::as_str) == Some(step_slug))
                .cloned()
        })
        .await
    }

    pub async fn wait_for_status(&self, game_id: Uuid, step_slug: &str, status: StepStatus) {
        let key = (game_id, step_slug.to_string());
        self.wait_until(|state| {
            state
                .progress
                .get(&key)
                .filter(|p| p.status == status)
                .map(|_| ())
        })
        .await
    }

    /// Complete a pending request the way the request gateway does on
    /// submission, returning the signal to deliver to the waiting execution.
    pub fn respond(&self, request_id: Uuid, payload: Value) -> Signal {
        let mut state = self.lock();
        if let Some(request) = state.requests.iter_mut().find(|r| r.id == request_id) {
            request.status = RequestStatus::Completed;
            request.result = Some(payload.clone());
            request.completed_at = Some(Utc::now());
        }
        drop(state);
        self.changed.notify_waiters();
        Signal {
            request_id: Some(request_id.to_string()),
            payload,
        }
    }
}

#[async_trait]
impl OnboardingBackend for MemoryBackend {
    async fn get_plan(&self, game_id: Uuid) -> Result<PlanSnapshot, BackendError> {
        self.enter(BackendOp::GetPlan).await?;
        let state = self.lock();
        let steps = state
            .catalog
            .iter()
            .map(|step| {
                let mut record = step.clone();
                match state.progress.get(&(game_id, step.slug.clone())) {
                    Some(progress) => {
                        record.status = Some(progress.status);
                        record.result = progress.result.clone();
                        record.last_run_at = progress.last_run_at;
                    }
                    None => record.status = None,
                }
                record
            })
            .collect();
        Ok(PlanSnapshot {
            steps,
            platform_configs: state.platform_configs.get(&game_id).cloned().unwrap_or_default(),
        })
    }

    async fn update_step_status(&self, update: &StatusUpdate) -> Result<(), BackendError> {
        self.enter(BackendOp::UpdateStepStatus).await?;
        {
            let mut state = self.lock();
            let now = Utc::now();
            let progress = state
                .progress
                .entry((update.game_id, update.step_slug.clone()))
                .or_insert_with(|| StepProgress::new(update.game_id, &update.step_slug));
            progress.status = update.status;
            if let Some(result) = &update.result {
                progress.result = result.clone();
            }
            if update.status == StepStatus::Running {
                progress.last_run_at = Some(now);
            }
            progress.updated_at = now;
            state.status_log.push(update.clone());
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn create_request(&self, request: &NewRequest) -> Result<Uuid, BackendError> {
        self.enter(BackendOp::CreateRequest).await?;
        let id = Uuid::new_v4();
        self.lock().requests.push(OnboardingRequest {
            id,
            game_id: request.game_id,
            step_slug: request.step_slug.clone(),
            workflow_id: request.workflow_id.clone(),
            request_type: request.request_type,
            config: request.config.clone(),
            status: RequestStatus::Pending,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        });
        self.changed.notify_waiters();
        Ok(id)
    }

    async fn cancel_pending_requests(&self, game_id: Uuid) -> Result<u64, BackendError> {
        self.enter(BackendOp::CancelPendingRequests).await?;
        let mut cancelled = 0;
        for request in self.lock().requests.iter_mut() {
            if request.game_id == game_id && request.status == RequestStatus::Pending {
                request.status = RequestStatus::Cancelled;
                cancelled += 1;
            }
        }
        self.changed.notify_waiters();
        Ok(cancelled)
    }

    async fn get_platform_config(
        &self,
        game_id: Uuid,
        platform_slug: &str,
    ) -> Result<Map<String, Value>, BackendError> {
        self.enter(BackendOp::GetPlatformConfig).await?;
        Ok(self
            .lock()
            .platform_configs
            .get(&game_id)
            .and_then(|configs| configs.iter().find(|c| c.slug == platform_slug))
            .map(|c| c.config.clone())
            .unwrap_or_default())
    }

    async fn trigger_step(&self, game_id: Uuid, step_slug: &str) -> Result<Value, BackendError> {
        self.enter(BackendOp::TriggerStep).await?;
        self.lock()
            .triggered_steps
            .push((game_id, step_slug.to_string()));
        Ok(json!({ "triggered": true, "stepSlug": step_slug }))
    }

    async fn trigger_external_job(
        &self,
        trigger: &JobTrigger,
    ) -> Result<JobExecution, BackendError> {
        self.enter(BackendOp::TriggerExternalJob).await?;
        let execution = JobExecution {
            execution_id: Uuid::new_v4().to_string(),
        };
        self.lock().jobs.push((trigger.clone(), execution.clone()));
        self.changed.notify_waiters();
        Ok(execution)
    }

    async fn persist_form_answers(
        &self,
        game_id: Uuid,
        target_table: &str,
        answers: &Map<String, Value>,
    ) -> Result<(), BackendError> {
        self.enter(BackendOp::PersistFormAnswers).await?;
        self.lock()
            .form_answers
            .push((game_id, target_table.to_string(), answers.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestType;

    fn manual_step(slug: &str) -> PlanStepRecord {
        serde_json::from_value(json!({"slug": slug, "executorKind": "manual"})).unwrap()
    }

    #[tokio::test]
    async fn test_plan_joins_progress() {
        let backend = MemoryBackend::new();
        let game = Uuid::new_v4();
        backend.add_step(manual_step("a"));
        backend.add_step(manual_step("b"));
        backend.seed_status(game, "a", StepStatus::Completed);

        let plan = backend.get_plan(game).await.unwrap();
        assert_eq!(plan.steps[0].status, Some(StepStatus::Completed));
        assert_eq!(plan.steps[1].status, None);

        // Another game sees its own progress only.
        let other = backend.get_plan(Uuid::new_v4()).await.unwrap();
        assert_eq!(other.steps[0].status, None);
    }

    #[tokio::test]
    async fn test_status_upsert_and_log() {
        let backend = MemoryBackend::new();
        let game = Uuid::new_v4();
        let update = StatusUpdate {
            game_id: game,
            step_slug: "a".into(),
            status: StepStatus::Running,
            result: None,
            workflow_id: "wf".into(),
        };
        backend.update_step_status(&update).await.unwrap();
        let progress = backend.step_progress(game, "a").unwrap();
        assert_eq!(progress.status, StepStatus::Running);
        assert!(progress.last_run_at.is_some());
        assert_eq!(backend.status_log(), vec![update]);
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let backend = MemoryBackend::new();
        backend.fail_next(BackendOp::GetPlan, BackendError::Transport("reset".into()));
        assert!(backend.get_plan(Uuid::nil()).await.is_err());
        assert!(backend.get_plan(Uuid::nil()).await.is_ok());
        assert_eq!(backend.call_count(BackendOp::GetPlan), 2);
    }

    #[tokio::test]
    async fn test_respond_and_cancel_requests() {
        let backend = MemoryBackend::new();
        let game = Uuid::new_v4();
        let new = |slug: &str| NewRequest {
            game_id: game,
            step_slug: slug.into(),
            workflow_id: "wf".into(),
            request_type: RequestType::ConfigForm,
            config: json!({}),
        };
        let first = backend.create_request(&new("a")).await.unwrap();
        backend.create_request(&new("b")).await.unwrap();

        let found = backend.wait_for_request(|r| r.step_slug == "a").await;
        assert_eq!(found.id, first);

        let signal = backend.respond(first, json!({"ok": true}));
        assert_eq!(signal.request_id, Some(first.to_string()));

        assert_eq!(backend.cancel_pending_requests(game).await.unwrap(), 1);
        let statuses: Vec<_> = backend.requests().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![RequestStatus::Completed, RequestStatus::Cancelled]
        );
    }
}
