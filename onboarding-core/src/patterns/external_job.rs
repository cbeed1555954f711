//! External job dispatch.
//!
//! Marks the step running, triggers the job with this execution's id as the
//! correlation id, then waits (bounded) for the job to post its completion
//! signal back. The step's terminal status is written here and nowhere else.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::record_failure;
use crate::catalog::ExternalJobConfig;
use crate::context::ExecutionContext;
use crate::duration::HumanDuration;
use crate::error::{OnboardingError, Result};
use crate::types::{JobCallback, JobOutcome, JobTrigger, StepStatus};

pub async fn run(
    ctx: &ExecutionContext,
    step_slug: &str,
    platform: Option<&str>,
    job: &ExternalJobConfig,
) -> Result<Map<String, Value>> {
    let outcome = dispatch(ctx, step_slug, platform, job).await;
    record_failure(ctx, step_slug, outcome).await
}

async fn dispatch(
    ctx: &ExecutionContext,
    step_slug: &str,
    platform: Option<&str>,
    job: &ExternalJobConfig,
) -> Result<Map<String, Value>> {
    ctx.set_status(step_slug, StepStatus::Running, None).await?;

    let config = ctx.config();
    let namespace = job
        .namespace
        .clone()
        .unwrap_or_else(|| config.default_job_namespace.clone());
    let timeout = job
        .timeout
        .map(|t| t.get())
        .unwrap_or_else(|| config.default_job_timeout.get());

    // Later sources win: step identity, job inputs, platform config.
    let mut inputs = Map::new();
    inputs.insert("gameId".into(), json!(ctx.game_id().to_string()));
    inputs.insert("stepSlug".into(), json!(step_slug));
    inputs.extend(job.inputs.clone());
    if let Some(platform) = platform {
        match ctx
            .activities()
            .fetch_platform_config(ctx.cancel_token(), ctx.game_id(), platform)
            .await
        {
            Ok(platform_inputs) => inputs.extend(platform_inputs),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    game_id = %ctx.game_id(),
                    step = step_slug,
                    platform,
                    error = %e,
                    "platform config unavailable, triggering job without it"
                );
            }
        }
    }
    inputs.insert("correlationId".into(), json!(ctx.execution_id()));

    let mut labels = BTreeMap::new();
    labels.insert("game_id".to_string(), ctx.game_id().to_string());
    labels.insert("step_slug".to_string(), step_slug.to_string());
    labels.insert("platform".to_string(), platform.unwrap_or("global").to_string());

    let trigger = JobTrigger {
        job_id: job.job_id.clone(),
        namespace,
        correlation_id: ctx.execution_id().to_string(),
        inputs,
        labels,
    };

    ctx.arm_callback(step_slug);
    let execution = match ctx.activities().trigger_job(ctx.cancel_token(), &trigger).await {
        Ok(execution) => execution,
        Err(e) => {
            ctx.disarm();
            return Err(e);
        }
    };
    ctx.bind_awaited(execution.execution_id.clone());
    tracing::info!(
        game_id = %ctx.game_id(),
        step = step_slug,
        job_id = %trigger.job_id,
        namespace = %trigger.namespace,
        runner_execution = %execution.execution_id,
        timeout = %HumanDuration(timeout),
        "external job triggered"
    );

    let Some(payload) = ctx.await_callback(timeout).await? else {
        tracing::error!(step = step_slug, job_id = %job.job_id, "external job timed out");
        ctx.set_status(
            step_slug,
            StepStatus::Error,
            Some(json!({
                "timedOut": true,
                "error": format!("Job did not report back within {}", HumanDuration(timeout)),
                "executionId": execution.execution_id,
            })),
        )
        .await?;
        return Err(OnboardingError::JobTimedOut {
            step_slug: step_slug.to_string(),
            job_id: job.job_id.clone(),
            timeout,
        });
    };

    let callback = JobCallback::from_payload(payload);
    match callback.status {
        JobOutcome::Success => {
            let mut result = callback.result;
            result.insert("executionId".into(), json!(execution.execution_id));
            result.insert("jobId".into(), json!(trigger.job_id));
            result.insert("namespace".into(), json!(trigger.namespace));
            ctx.set_status(step_slug, StepStatus::Completed, Some(Value::Object(result.clone())))
                .await?;
            Ok(result)
        }
        JobOutcome::Failure => {
            ctx.set_status(
                step_slug,
                StepStatus::Error,
                Some(json!({
                    "executionId": execution.execution_id,
                    "error": "Job returned FAILED status",
                    "details": callback.result,
                })),
            )
            .await?;
            Err(OnboardingError::JobFailed {
                step_slug: step_slug.to_string(),
                job_id: job.job_id.clone(),
                execution_id: execution.execution_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, MemoryBackend};
    use crate::cancel::CancelToken;
    use crate::config::EngineConfig;
    use crate::context::Dependencies;
    use crate::error::BackendError;
    use crate::signal::Signal;
    use crate::types::PlatformConfig;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn job(timeout: Option<Duration>) -> ExternalJobConfig {
        let mut inputs = Map::new();
        inputs.insert("mode".into(), json!("full"));
        ExternalJobConfig {
            job_id: "steam-sync".into(),
            namespace: None,
            inputs,
            timeout: timeout.map(HumanDuration),
        }
    }

    fn setup() -> (Arc<MemoryBackend>, Dependencies, ExecutionContext, Uuid) {
        let backend = Arc::new(MemoryBackend::new());
        let deps = Dependencies::new(backend.clone(), EngineConfig::default());
        let game = Uuid::new_v4();
        let ctx = ExecutionContext::root(deps.clone(), "external-job-g-sync", game, CancelToken::never())
            .unwrap();
        (backend, deps, ctx, game)
    }

    #[tokio::test]
    async fn test_success_completes_with_merged_result() {
        let (backend, deps, ctx, game) = setup();
        let mut steam = Map::new();
        steam.insert("apiKey".into(), json!("k"));
        backend.set_platform_config(
            game,
            PlatformConfig {
                slug: "steam".into(),
                config: steam,
                required_fields: vec![],
            },
        );

        let callback = async {
            let (trigger, execution) = backend.wait_for_job("sync").await;
            assert_eq!(trigger.namespace, "lovelace");
            assert_eq!(trigger.correlation_id, "external-job-g-sync");
            assert_eq!(trigger.inputs["mode"], "full");
            assert_eq!(trigger.inputs["apiKey"], "k");
            assert_eq!(trigger.inputs["stepSlug"], "sync");
            assert_eq!(trigger.labels["platform"], "steam");
            let signal = Signal::from_payload(json!({"status": "SUCCESS", "result": {"rows": 3}}))
                .with_request_id(execution.execution_id);
            assert!(deps.signals.deliver("external-job-g-sync", signal).unwrap().is_delivered());
        };
        let job = job(None);
        let (result, ()) = tokio::join!(run(&ctx, "sync", Some("steam"), &job), callback);

        let result = result.unwrap();
        assert_eq!(result["rows"], 3);
        assert_eq!(result["jobId"], "steam-sync");
        assert_eq!(result["namespace"], "lovelace");
        assert!(result["executionId"].is_string());
        assert_eq!(backend.step_status(game, "sync"), Some(StepStatus::Completed));
        assert_eq!(backend.step_progress(game, "sync").unwrap().result["rows"], 3);
    }

    #[tokio::test]
    async fn test_failure_callback_records_error() {
        let (backend, deps, ctx, game) = setup();
        let callback = async {
            backend.wait_for_job("sync").await;
            let signal = Signal::from_payload(json!({"status": "FAILURE", "result": "bad rows"}));
            deps.signals.deliver("external-job-g-sync", signal).unwrap();
        };
        let job = job(None);
        let (result, ()) = tokio::join!(run(&ctx, "sync", None, &job), callback);

        assert!(matches!(result, Err(OnboardingError::JobFailed { .. })));
        let progress = backend.step_progress(game, "sync").unwrap();
        assert_eq!(progress.status, StepStatus::Error);
        assert_eq!(progress.result["error"], "Job returned FAILED status");
        assert_eq!(progress.result["details"]["raw"], "bad rows");
        // One running write, one error write: no duplicate error from the wrapper.
        assert_eq!(backend.status_log().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_records_timed_out_error() {
        let (backend, _deps, ctx, game) = setup();
        let job = job(Some(Duration::from_secs(90)));
        let err = run(&ctx, "sync", None, &job).await.unwrap_err();

        assert!(matches!(err, OnboardingError::JobTimedOut { .. }));
        let progress = backend.step_progress(game, "sync").unwrap();
        assert_eq!(progress.status, StepStatus::Error);
        assert_eq!(progress.result["timedOut"], true);
        assert!(progress.result["executionId"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_failure_records_error() {
        let (backend, _deps, ctx, game) = setup();
        backend.fail_next(
            BackendOp::TriggerExternalJob,
            BackendError::from_status(404, "no such flow"),
        );
        let job = job(None);
        let err = run(&ctx, "sync", None, &job).await.unwrap_err();

        assert!(matches!(err, OnboardingError::Activity { .. }));
        let progress = backend.step_progress(game, "sync").unwrap();
        assert_eq!(progress.status, StepStatus::Error);
        assert!(progress.result["error"]
            .as_str()
            .unwrap()
            .contains("trigger_external_job"));
    }

    #[tokio::test]
    async fn test_platform_config_failure_still_triggers_job() {
        let (backend, deps, ctx, game) = setup();
        backend.fail_next(
            BackendOp::GetPlatformConfig,
            BackendError::from_status(404, "no integration"),
        );

        let callback = async {
            let (trigger, execution) = backend.wait_for_job("sync").await;
            assert_eq!(trigger.inputs["mode"], "full");
            assert!(trigger.inputs.get("apiKey").is_none());
            assert_eq!(trigger.labels["platform"], "steam");
            let signal = Signal::from_payload(json!({"status": "SUCCESS"}))
                .with_request_id(execution.execution_id);
            assert!(deps.signals.deliver("external-job-g-sync", signal).unwrap().is_delivered());
        };
        let job = job(None);
        let (result, ()) = tokio::join!(run(&ctx, "sync", Some("steam"), &job), callback);

        assert!(result.is_ok());
        assert_eq!(backend.jobs().len(), 1);
        assert_eq!(backend.step_status(game, "sync"), Some(StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_job_and_platform_inputs_override_step_identity() {
        let (backend, deps, ctx, game) = setup();
        let mut steam = Map::new();
        steam.insert("mode".into(), json!("delta"));
        backend.set_platform_config(
            game,
            PlatformConfig {
                slug: "steam".into(),
                config: steam,
                required_fields: vec![],
            },
        );
        let mut job = job(None);
        job.inputs.insert("gameId".into(), json!("legacy-id"));

        let callback = async {
            let (trigger, execution) = backend.wait_for_job("sync").await;
            assert_eq!(trigger.inputs["gameId"], "legacy-id");
            assert_eq!(trigger.inputs["stepSlug"], "sync");
            assert_eq!(trigger.inputs["mode"], "delta");
            assert_eq!(trigger.inputs["correlationId"], "external-job-g-sync");
            let signal = Signal::from_payload(json!({}))
                .with_request_id(execution.execution_id);
            deps.signals.deliver("external-job-g-sync", signal).unwrap();
        };
        let (result, ()) = tokio::join!(run(&ctx, "sync", Some("steam"), &job), callback);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_callback_status_is_failure() {
        let (backend, deps, ctx, game) = setup();
        let callback = async {
            backend.wait_for_job("sync").await;
            let signal = Signal::from_payload(json!({"status": "KILLED"}));
            deps.signals.deliver("external-job-g-sync", signal).unwrap();
        };
        let job = job(None);
        let (result, ()) = tokio::join!(run(&ctx, "sync", None, &job), callback);

        assert!(matches!(result, Err(OnboardingError::JobFailed { .. })));
        assert_eq!(backend.step_status(game, "sync"), Some(StepStatus::Error));
    }
}
