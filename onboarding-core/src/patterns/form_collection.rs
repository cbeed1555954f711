//! Form collection: one config form, answers become the step result.

use serde_json::{json, Map, Value};

use super::record_failure;
use crate::catalog::FormConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::{RequestType, StepStatus};

const DEFAULT_TITLE: &str = "Form";
const DEFAULT_DESCRIPTION: &str = "Please fill in the required information.";

pub async fn run(
    ctx: &ExecutionContext,
    step_slug: &str,
    config: &FormConfig,
) -> Result<Map<String, Value>> {
    let outcome = collect(ctx, step_slug, config).await;
    record_failure(ctx, step_slug, outcome).await
}

async fn collect(
    ctx: &ExecutionContext,
    step_slug: &str,
    config: &FormConfig,
) -> Result<Map<String, Value>> {
    ctx.set_status(step_slug, StepStatus::Running, None).await?;

    ctx.raise_request(
        step_slug,
        RequestType::ConfigForm,
        json!({
            "title": config.title.as_deref().unwrap_or(DEFAULT_TITLE),
            "description": config.description.as_deref().unwrap_or(DEFAULT_DESCRIPTION),
            "fields": config.fields,
            "targetTable": config.target_table,
        }),
    )
    .await?;
    let answers: Map<String, Value> = ctx.await_response("form").await?;

    if let Some(table) = &config.target_table {
        ctx.activities()
            .persist_form_answers(ctx.cancel_token(), ctx.game_id(), table, &answers)
            .await?;
    }

    ctx.set_status(step_slug, StepStatus::Completed, Some(Value::Object(answers.clone())))
        .await?;
    Ok(answers)
}
