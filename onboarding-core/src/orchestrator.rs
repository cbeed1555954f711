//! Main onboarding run for one game.
//!
//! 1. Load the plan and keep the steps that are neither completed nor skipped.
//! 2. Gate on platform configuration: one config request per platform with
//!    missing fields (or one batch request), each waited on before moving on.
//! 3. Gate on plan review: the reviewer returns the slugs to run; the rest
//!    are marked skipped.
//! 4. Run the approved steps in platform groups. Groups run concurrently;
//!    steps inside a group run in `order`, one at a time, and a failing step
//!    stops the rest of its group.
//! 5. A run where every group failed fails. A partial failure completes.
//!
//! Cancellation at any checkpoint triggers a sweep that marks every step of
//! this run not known to be completed as cancelled, then the run ends
//! with [`OnboardingError::Cancelled`].

use std::collections::HashSet;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::activities::{config_step_slug, ConfigValidation, BATCH_CONFIG_SLUG};
use crate::cancel::CancelToken;
use crate::catalog::{
    distinct_platforms, group_by_platform, OnboardingPlan, PlanStep, PlatformActivityConfig,
    PlatformGroup, StepExecutor, StepSummary,
};
use crate::context::ExecutionContext;
use crate::error::{OnboardingError, Result};
use crate::ids;
use crate::patterns::{csv_ingestion, external_job, form_collection, record_failure};
use crate::platform::ActivityCall;
use crate::signal::AwaitKind;
use crate::types::{RequestType, StepStatus};

pub const PLAN_REVIEW_SLUG: &str = "global-plan-review";

/// Reviewer's answer to the plan review request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReview {
    pub validated_slugs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFailure {
    pub platform: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunSummary {
    /// Every step was already completed or skipped.
    NothingToDo,
    #[serde(rename_all = "camelCase")]
    Finished {
        groups: usize,
        failed_groups: Vec<GroupFailure>,
        skipped: Vec<String>,
    },
}

pub async fn run_onboarding(ctx: &ExecutionContext) -> Result<RunSummary> {
    let snapshot = ctx
        .activities()
        .fetch_plan(ctx.cancel_token(), ctx.game_id())
        .await?;
    let plan = OnboardingPlan::from_snapshot(snapshot, ctx.registry())?;
    let steps = plan.steps_to_process();
    if steps.is_empty() {
        tracing::info!(game_id = %ctx.game_id(), "nothing left to onboard");
        return Ok(RunSummary::NothingToDo);
    }
    tracing::info!(
        game_id = %ctx.game_id(),
        workflow_id = ctx.execution_id(),
        steps = steps.len(),
        "onboarding run started"
    );

    match drive(ctx, &steps).await {
        Err(e) if e.is_cancellation() => {
            sweep_cancelled(ctx, &steps).await;
            Err(e)
        }
        other => other,
    }
}

async fn drive(ctx: &ExecutionContext, steps: &[PlanStep]) -> Result<RunSummary> {
    validate_platform_configs(ctx, &distinct_platforms(steps)).await?;

    let review = review_plan(ctx, steps).await?;
    let validated: HashSet<&str> = review.validated_slugs.iter().map(String::as_str).collect();
    let (approved, skipped): (Vec<PlanStep>, Vec<PlanStep>) = steps
        .iter()
        .cloned()
        .partition(|s| validated.contains(s.slug.as_str()));

    for step in &skipped {
        if let Err(e) = ctx.set_status(&step.slug, StepStatus::Skipped, None).await {
            if e.is_cancellation() {
                return Err(e);
            }
            tracing::warn!(step = %step.slug, error = %e, "could not mark step skipped");
        }
    }

    let groups = group_by_platform(&approved);
    tracing::info!(
        game_id = %ctx.game_id(),
        groups = groups.len(),
        approved = approved.len(),
        skipped = skipped.len(),
        "plan approved"
    );
    let outcomes = join_all(groups.iter().map(|group| run_group(ctx, group))).await;

    if ctx.cancel_token().is_cancelled()
        || outcomes
            .iter()
            .any(|o| o.as_ref().is_err_and(OnboardingError::is_cancellation))
    {
        return Err(OnboardingError::Cancelled);
    }

    let failed_groups: Vec<GroupFailure> = groups
        .iter()
        .zip(outcomes)
        .filter_map(|(group, outcome)| {
            outcome.err().map(|e| GroupFailure {
                platform: group.label().to_string(),
                error: e.to_string(),
            })
        })
        .collect();

    if !groups.is_empty() && failed_groups.len() == groups.len() {
        tracing::error!(game_id = %ctx.game_id(), groups = groups.len(), "every platform group failed");
        return Err(OnboardingError::AllGroupsFailed(failed_groups.len()));
    }
    if !failed_groups.is_empty() {
        tracing::warn!(
            game_id = %ctx.game_id(),
            failed = failed_groups.len(),
            groups = groups.len(),
            "onboarding finished with failed groups"
        );
    } else {
        tracing::info!(game_id = %ctx.game_id(), "onboarding finished");
    }

    Ok(RunSummary::Finished {
        groups: groups.len(),
        failed_groups,
        skipped: skipped.into_iter().map(|s| s.slug).collect(),
    })
}

// ---------------------------------------------------------------------------
// Human gates
// ---------------------------------------------------------------------------

async fn validate_platform_configs(ctx: &ExecutionContext, platforms: &[String]) -> Result<()> {
    if platforms.is_empty() {
        return Ok(());
    }
    let activities = ctx.activities();

    if ctx.config().batch_config_validation {
        ctx.arm(AwaitKind::ConfigForm, BATCH_CONFIG_SLUG);
        let outcome = activities
            .validate_all_platform_configs(
                ctx.cancel_token(),
                ctx.game_id(),
                platforms,
                ctx.execution_id(),
            )
            .await;
        return await_config_gate(ctx, outcome, "platform configuration").await;
    }

    for platform in platforms {
        ctx.arm(AwaitKind::ConfigForm, &config_step_slug(platform));
        let outcome = activities
            .validate_platform_config(
                ctx.cancel_token(),
                ctx.game_id(),
                platform,
                ctx.execution_id(),
            )
            .await;
        await_config_gate(ctx, outcome, &format!("{platform} configuration")).await?;
    }
    Ok(())
}

async fn await_config_gate(
    ctx: &ExecutionContext,
    outcome: Result<ConfigValidation>,
    gate: &str,
) -> Result<()> {
    match outcome {
        Ok(ConfigValidation::Missing { request_id, .. }) => {
            ctx.bind_awaited(request_id.to_string());
            let _: Value = ctx.await_response(gate).await?;
            tracing::info!(game_id = %ctx.game_id(), gate, "configuration provided");
            Ok(())
        }
        Ok(ConfigValidation::Valid) => {
            ctx.disarm();
            Ok(())
        }
        Err(e) => {
            ctx.disarm();
            Err(e)
        }
    }
}

async fn review_plan(ctx: &ExecutionContext, steps: &[PlanStep]) -> Result<PlanReview> {
    let summaries: Vec<StepSummary> = steps.iter().map(PlanStep::summary).collect();
    ctx.raise_request(
        PLAN_REVIEW_SLUG,
        RequestType::ReviewPlan,
        json!({ "steps": summaries }),
    )
    .await?;
    ctx.await_response("plan review").await
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

async fn run_group(ctx: &ExecutionContext, group: &PlatformGroup) -> Result<()> {
    for step in &group.steps {
        if let Err(e) = run_step(ctx, step).await {
            if !e.is_cancellation() {
                tracing::warn!(
                    game_id = %ctx.game_id(),
                    platform = group.label(),
                    step = %step.slug,
                    error = %e,
                    "step failed, stopping group"
                );
            }
            return Err(e);
        }
    }
    Ok(())
}

async fn run_step(ctx: &ExecutionContext, step: &PlanStep) -> Result<()> {
    let game_id = ctx.game_id();
    match &step.executor {
        StepExecutor::CsvImport(config) => {
            let child = ctx.child(ids::csv_ingest_id(game_id, &step.slug))?;
            csv_ingestion::run(&child, &step.slug, config).await?;
        }
        StepExecutor::ExternalJob(config) => {
            let child = ctx.child(ids::external_job_id(game_id, &step.slug))?;
            external_job::run(&child, &step.slug, step.platform.as_deref(), config).await?;
        }
        StepExecutor::Form(config) => {
            let child = ctx.child(ids::form_input_id(game_id, &step.slug))?;
            form_collection::run(&child, &step.slug, config).await?;
        }
        StepExecutor::PlatformActivity(config) => {
            let outcome = run_platform_activity(ctx, step, config).await;
            record_failure(ctx, &step.slug, outcome).await?;
        }
        StepExecutor::Script(_) | StepExecutor::Manual => {
            tracing::debug!(
                step = %step.slug,
                kind = step.executor.kind(),
                "step is not dispatched by the engine"
            );
        }
    }
    Ok(())
}

async fn run_platform_activity(
    ctx: &ExecutionContext,
    step: &PlanStep,
    config: &PlatformActivityConfig,
) -> Result<()> {
    let handler = ctx
        .registry()
        .get(&config.activity_name)
        .ok_or_else(|| OnboardingError::UnknownActivity(config.activity_name.clone()))?;
    ctx.set_status(&step.slug, StepStatus::Running, None).await?;

    let call = ActivityCall {
        game_id: ctx.game_id(),
        step_slug: step.slug.clone(),
        workflow_id: ctx.execution_id().to_string(),
        params: config.params.clone(),
    };
    let result = ctx
        .activities()
        .run_platform_activity(ctx.cancel_token(), handler.as_ref(), &call)
        .await?;
    ctx.set_status(&step.slug, StepStatus::Completed, Some(result))
        .await
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Mark every step of this run not known to be completed as cancelled and
/// withdraw open human requests. Runs to the end regardless of cancellation.
async fn sweep_cancelled(ctx: &ExecutionContext, steps: &[PlanStep]) {
    tracing::warn!(game_id = %ctx.game_id(), "onboarding cancelled, sweeping unfinished steps");
    for step in steps {
        if ctx.ledger().last(&step.slug) == Some(StepStatus::Completed) {
            continue;
        }
        if let Err(e) = ctx
            .set_status_detached(&step.slug, StepStatus::Cancelled, None)
            .await
        {
            tracing::error!(step = %step.slug, error = %e, "could not mark step cancelled");
        }
    }
    match ctx
        .activities()
        .cancel_pending_requests(&CancelToken::never(), ctx.game_id())
        .await
    {
        Ok(count) => tracing::info!(game_id = %ctx.game_id(), count, "pending requests cancelled"),
        Err(e) => tracing::warn!(game_id = %ctx.game_id(), error = %e, "could not cancel pending requests"),
    }
}
