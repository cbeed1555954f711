//! CSV ingestion.
//!
//! Asks a human to upload and map a file, then hands the upload to the
//! ingestion job as a child [`external_job`](super::external_job) execution.
//! Only that child writes the step's completed or error status.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::external_job;
use crate::catalog::{CsvImportConfig, ExternalJobConfig};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::ids;
use crate::types::{RequestType, StepStatus};

const DEFAULT_LABEL: &str = "CSV import";
const DEFAULT_INSTRUCTIONS: &str = "Upload and map your file.";

/// What the uploader sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvUpload {
    pub s3_key: String,
    #[serde(default)]
    pub mapping: Value,
}

pub async fn run(
    ctx: &ExecutionContext,
    step_slug: &str,
    config: &CsvImportConfig,
) -> Result<Map<String, Value>> {
    ctx.set_status(step_slug, StepStatus::Running, None).await?;

    ctx.raise_request(
        step_slug,
        RequestType::UploadCsv,
        json!({
            "label": config.label.as_deref().unwrap_or(DEFAULT_LABEL),
            "targetTable": config.target_table,
            "expectedColumns": config.expected_columns,
            "instructions": config.instructions.as_deref().unwrap_or(DEFAULT_INSTRUCTIONS),
        }),
    )
    .await?;
    let upload: CsvUpload = ctx.await_response("csv upload").await?;
    tracing::info!(
        game_id = %ctx.game_id(),
        step = step_slug,
        s3_key = %upload.s3_key,
        "csv uploaded, delegating ingestion"
    );

    let mut inputs = Map::new();
    inputs.insert("s3Key".into(), json!(upload.s3_key));
    inputs.insert("mapping".into(), json!(upload.mapping.to_string()));
    inputs.insert("targetTable".into(), json!(config.target_table));
    let job = ExternalJobConfig {
        job_id: ctx.config().csv_job_id.clone(),
        namespace: Some(ctx.config().csv_job_namespace.clone()),
        inputs,
        timeout: None,
    };

    let child = ctx.child(ids::external_job_id(ctx.game_id(), step_slug))?;
    external_job::run(&child, step_slug, None, &job).await
}
