//! Reusable step patterns, each run as its own child execution.
//!
//! - [`external_job`]: trigger a job on the runner and wait for its callback.
//! - [`csv_ingestion`]: ask for an upload, then hand the file to an external job.
//! - [`form_collection`]: ask for form answers and store them as the step result.

pub mod csv_ingestion;
pub mod external_job;
pub mod form_collection;

use serde_json::{json, Value};

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::StepStatus;

/// Record `err` as the step's error result unless it is a cancellation or
/// the pattern already wrote a terminal status for it.
pub(crate) async fn record_failure<T>(
    ctx: &ExecutionContext,
    step_slug: &str,
    outcome: Result<T>,
) -> Result<T> {
    let err = match outcome {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    if err.is_cancellation() || err.status_recorded() {
        return Err(err);
    }
    tracing::error!(
        game_id = %ctx.game_id(),
        step = step_slug,
        execution_id = ctx.execution_id(),
        error = %err,
        "step failed"
    );
    if let Err(write_err) = ctx
        .set_status(step_slug, StepStatus::Error, Some(error_result(&err.to_string())))
        .await
    {
        tracing::warn!(step = step_slug, error = %write_err, "could not record step failure");
    }
    Err(err)
}

fn error_result(message: &str) -> Value {
    json!({ "error": message })
}
