//! Activity adapters.
//!
//! Every side effect the engine performs goes through [`Activities`]: one
//! backend call per attempt, bounded by a start-to-close timeout and retried
//! with exponential backoff while the error is retryable. Both the call and
//! the backoff sleep are cancellation checkpoints.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::backend::OnboardingBackend;
use crate::cancel::CancelToken;
use crate::catalog::PlanSnapshot;
use crate::error::{BackendError, OnboardingError, Result};
use crate::platform::{ActivityCall, PlatformActivity};
use crate::types::{
    JobExecution, JobTrigger, MissingConfig, NewRequest, PlatformConfig, RequestType,
    StatusUpdate,
};

/// Slug used for the batch config request covering every platform.
pub const BATCH_CONFIG_SLUG: &str = "config-platforms-batch";

pub fn config_step_slug(platform_slug: &str) -> String {
    format!("config-{platform_slug}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_coefficient: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_coefficient.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close: Duration,
    pub retry: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of checking stored platform configs against their required fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidation {
    Valid,
    Missing {
        request_id: Uuid,
        missing: Vec<MissingConfig>,
    },
}

pub struct Activities {
    backend: Arc<dyn OnboardingBackend>,
    options: ActivityOptions,
}

impl Activities {
    pub fn new(backend: Arc<dyn OnboardingBackend>, options: ActivityOptions) -> Self {
        Self { backend, options }
    }

    pub fn backend(&self) -> &Arc<dyn OnboardingBackend> {
        &self.backend
    }

    pub fn options(&self) -> &ActivityOptions {
        &self.options
    }

    async fn call<T, F, Fut>(&self, activity: &'static str, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, BackendError>> + Send,
        T: Send,
    {
        let policy = &self.options.retry;
        let mut attempt = 1;
        loop {
            tracing::debug!(activity, attempt, "activity attempt");
            let outcome = cancel
                .checkpoint(tokio::time::timeout(self.options.start_to_close, op()))
                .await?;
            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => BackendError::Timeout(self.options.start_to_close),
            };

            if !err.is_retryable() || attempt >= policy.max_attempts {
                tracing::error!(activity, attempt, error = %err, "activity failed");
                return Err(OnboardingError::Activity {
                    activity,
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(activity, attempt, error = %err, ?delay, "activity failed, retrying");
            cancel.checkpoint(tokio::time::sleep(delay)).await?;
            attempt += 1;
        }
    }

    // ── Plan and progress ──

    pub async fn fetch_plan(&self, cancel: &CancelToken, game_id: Uuid) -> Result<PlanSnapshot> {
        self.call("get_plan", cancel, || self.backend.get_plan(game_id))
            .await
    }

    pub async fn update_status(&self, cancel: &CancelToken, update: &StatusUpdate) -> Result<()> {
        self.call("update_step_status", cancel, || {
            self.backend.update_step_status(update)
        })
        .await
    }

    // ── Human requests ──

    pub async fn create_request(&self, cancel: &CancelToken, request: &NewRequest) -> Result<Uuid> {
        self.call("create_request", cancel, || self.backend.create_request(request))
            .await
    }

    pub async fn cancel_pending_requests(&self, cancel: &CancelToken, game_id: Uuid) -> Result<u64> {
        self.call("cancel_pending_requests", cancel, || {
            self.backend.cancel_pending_requests(game_id)
        })
        .await
    }

    // ── Platforms ──

    pub async fn fetch_platform_config(
        &self,
        cancel: &CancelToken,
        game_id: Uuid,
        platform_slug: &str,
    ) -> Result<Map<String, Value>> {
        self.call("get_platform_config", cancel, || {
            self.backend.get_platform_config(game_id, platform_slug)
        })
        .await
    }

    /// Check one platform's stored config. When fields are missing, raise a
    /// config request for them and return its id.
    pub async fn validate_platform_config(
        &self,
        cancel: &CancelToken,
        game_id: Uuid,
        platform_slug: &str,
        workflow_id: &str,
    ) -> Result<ConfigValidation> {
        let plan = self.fetch_plan(cancel, game_id).await?;
        let Some(missing) = missing_for(&plan.platform_configs, platform_slug) else {
            return Ok(ConfigValidation::Valid);
        };

        let request = NewRequest {
            game_id,
            step_slug: config_step_slug(platform_slug),
            workflow_id: workflow_id.to_string(),
            request_type: RequestType::ConfigForm,
            config: json!({
                "platformSlug": platform_slug,
                "missingFields": missing.missing_fields,
                "title": format!("Configure {platform_slug}"),
                "description": format!(
                    "The {platform_slug} integration is missing required settings."
                ),
            }),
        };
        let request_id = self.create_request(cancel, &request).await?;
        tracing::info!(%game_id, platform = platform_slug, %request_id, "platform config incomplete");
        Ok(ConfigValidation::Missing {
            request_id,
            missing: vec![missing],
        })
    }

    /// Check every listed platform at once and raise a single request for all gaps.
    pub async fn validate_all_platform_configs(
        &self,
        cancel: &CancelToken,
        game_id: Uuid,
        platform_slugs: &[String],
        workflow_id: &str,
    ) -> Result<ConfigValidation> {
        let plan = self.fetch_plan(cancel, game_id).await?;
        let missing: Vec<MissingConfig> = platform_slugs
            .iter()
            .filter_map(|slug| missing_for(&plan.platform_configs, slug))
            .collect();
        if missing.is_empty() {
            return Ok(ConfigValidation::Valid);
        }

        let request = NewRequest {
            game_id,
            step_slug: BATCH_CONFIG_SLUG.to_string(),
            workflow_id: workflow_id.to_string(),
            request_type: RequestType::ConfigForm,
            config: json!({
                "isBatch": true,
                "updates": missing,
                "title": "Configure platforms",
                "description": format!(
                    "{} platform integration(s) are missing required settings.",
                    missing.len()
                ),
            }),
        };
        let request_id = self.create_request(cancel, &request).await?;
        tracing::info!(%game_id, platforms = missing.len(), %request_id, "platform configs incomplete");
        Ok(ConfigValidation::Missing {
            request_id,
            missing,
        })
    }

    pub async fn run_platform_activity(
        &self,
        cancel: &CancelToken,
        handler: &dyn PlatformActivity,
        call: &ActivityCall,
    ) -> Result<Value> {
        self.call("platform_activity", cancel, || {
            handler.run(self.backend.as_ref(), call)
        })
        .await
    }

    // ── External jobs ──

    pub async fn trigger_job(&self, cancel: &CancelToken, trigger: &JobTrigger) -> Result<JobExecution> {
        self.call("trigger_external_job", cancel, || {
            self.backend.trigger_external_job(trigger)
        })
        .await
    }

    // ── Form answers ──

    pub async fn persist_form_answers(
        &self,
        cancel: &CancelToken,
        game_id: Uuid,
        target_table: &str,
        answers: &Map<String, Value>,
    ) -> Result<()> {
        self.call("persist_form_answers", cancel, || {
            self.backend.persist_form_answers(game_id, target_table, answers)
        })
        .await
    }
}

/// Missing fields for `platform_slug`, or `None` when nothing is missing.
/// A platform without a stored config record passes.
fn missing_for(configs: &[PlatformConfig], platform_slug: &str) -> Option<MissingConfig> {
    let config = configs.iter().find(|c| c.slug == platform_slug)?;
    let missing_fields = config.missing_fields();
    (!missing_fields.is_empty()).then(|| MissingConfig {
        platform_slug: platform_slug.to_string(),
        missing_fields,
    })
}
