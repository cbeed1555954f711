//! Core types shared by the engine, the backends and the HTTP surface.
//!
//! JSON casing follows the admin API: camelCase fields, lowercase step
//! statuses and SCREAMING_SNAKE request kinds.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "skipped" => Some(Self::Skipped),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Completed and skipped steps are never picked up again by a new run.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step progress
// ---------------------------------------------------------------------------

/// Per-game progress record for one step, keyed by `(game_id, step_slug)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepProgress {
    pub game_id: Uuid,
    pub step_slug: String,
    pub status: StepStatus,
    #[serde(default)]
    pub total_items: i64,
    #[serde(default)]
    pub processed_items: i64,
    #[serde(default)]
    pub failed_items: i64,
    #[serde(default)]
    pub result: Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StepProgress {
    pub fn new(game_id: Uuid, step_slug: impl Into<String>) -> Self {
        Self {
            game_id,
            step_slug: step_slug.into(),
            status: StepStatus::Pending,
            total_items: 0,
            processed_items: 0,
            failed_items: 0,
            result: Value::Null,
            last_run_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Upsert of a step's progress. `workflow_id` names the execution that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub game_id: Uuid,
    pub step_slug: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub workflow_id: String,
}

// ---------------------------------------------------------------------------
// Human requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    ReviewPlan,
    UploadCsv,
    ConfigForm,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReviewPlan => "REVIEW_PLAN",
            Self::UploadCsv => "UPLOAD_CSV",
            Self::ConfigForm => "CONFIG_FORM",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    #[default]
    Pending,
    Completed,
    Cancelled,
}

/// A human-in-the-loop request as held by the request gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingRequest {
    pub id: Uuid,
    pub game_id: Uuid,
    pub step_slug: String,
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(default)]
    pub config: Value,
    pub status: RequestStatus,
    #[serde(default)]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Body of a create-request call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRequest {
    pub game_id: Uuid,
    pub step_slug: String,
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub config: Value,
}

// ---------------------------------------------------------------------------
// Platform configuration
// ---------------------------------------------------------------------------

/// Stored integration config for one platform plus the fields its schema requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    #[serde(alias = "platformSlug")]
    pub slug: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, alias = "configSchema")]
    pub required_fields: Vec<String>,
}

impl PlatformConfig {
    /// Required fields whose stored value is absent or falsy
    /// (null, false, 0, or the empty string).
    pub fn missing_fields(&self) -> Vec<String> {
        self.required_fields
            .iter()
            .filter(|field| self.config.get(field.as_str()).map_or(true, is_falsy))
            .cloned()
            .collect()
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// One entry of a config-missing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingConfig {
    pub platform_slug: String,
    pub missing_fields: Vec<String>,
}

// ---------------------------------------------------------------------------
// External jobs
// ---------------------------------------------------------------------------

/// Everything the job runner needs to start one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTrigger {
    pub job_id: String,
    pub namespace: String,
    /// Execution id the job must post its completion signal back to.
    pub correlation_id: String,
    pub inputs: Map<String, Value>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    #[serde(alias = "id")]
    pub execution_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Normalised completion signal posted back by an external job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCallback {
    pub status: JobOutcome,
    pub result: Map<String, Value>,
}

impl JobCallback {
    /// Normalise a raw callback body.
    ///
    /// Only a missing (or empty) status or `SUCCESS` counts as success; any
    /// other status is a failure. A missing result means the whole body is
    /// the result; non-object results are wrapped as `{"raw": ...}`.
    pub fn from_payload(payload: Value) -> Self {
        let status = match payload.get("status") {
            None | Some(Value::Null) => JobOutcome::Success,
            Some(Value::String(s)) if s.is_empty() || s == "SUCCESS" => JobOutcome::Success,
            Some(_) => JobOutcome::Failure,
        };
        let result = match &payload {
            Value::Object(obj) if obj.contains_key("result") => obj["result"].clone(),
            _ => payload,
        };
        let result = match result {
            Value::Object(map) => map,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("raw".into(), other);
                wrapped
            }
        };
        Self { status, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_status_roundtrip() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Error,
            StepStatus::Skipped,
            StepStatus::Cancelled,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StepStatus::parse("done"), None);
        assert_eq!(
            serde_json::to_value(StepStatus::Cancelled).unwrap(),
            json!("cancelled")
        );
    }

    #[test]
    fn test_resolved_statuses() {
        assert!(StepStatus::Completed.is_resolved());
        assert!(StepStatus::Skipped.is_resolved());
        assert!(!StepStatus::Error.is_resolved());
        assert!(!StepStatus::Cancelled.is_resolved());
        assert!(!StepStatus::Pending.is_resolved());
    }

    #[test]
    fn test_request_type_wire_names() {
        assert_eq!(
            serde_json::to_value(RequestType::ReviewPlan).unwrap(),
            json!("REVIEW_PLAN")
        );
        let req = NewRequest {
            game_id: Uuid::nil(),
            step_slug: "global-plan-review".into(),
            workflow_id: "onboarding-x".into(),
            request_type: RequestType::UploadCsv,
            config: json!({}),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "UPLOAD_CSV");
        assert_eq!(v["stepSlug"], "global-plan-review");
    }

    #[test]
    fn test_missing_fields_uses_falsy_rule() {
        let cfg: PlatformConfig = serde_json::from_value(json!({
            "slug": "steam",
            "config": {"apiKey": "", "appId": 0, "enabled": false, "region": "eu", "tags": []},
            "requiredFields": ["apiKey", "appId", "enabled", "region", "tags", "secret"]
        }))
        .unwrap();
        assert_eq!(
            cfg.missing_fields(),
            vec!["apiKey", "appId", "enabled", "secret"]
        );
    }

    #[test]
    fn test_platform_config_accepts_admin_aliases() {
        let cfg: PlatformConfig = serde_json::from_value(json!({
            "platformSlug": "epic",
            "config": {"token": "t"},
            "configSchema": ["token"]
        }))
        .unwrap();
        assert_eq!(cfg.slug, "epic");
        assert!(cfg.missing_fields().is_empty());
    }

    #[test]
    fn test_job_callback_defaults_to_success_and_whole_payload() {
        let cb = JobCallback::from_payload(json!({"rows": 12}));
        assert_eq!(cb.status, JobOutcome::Success);
        assert_eq!(cb.result["rows"], 12);
    }

    #[test]
    fn test_job_callback_wraps_scalar_result() {
        let cb = JobCallback::from_payload(json!({"status": "FAILURE", "result": "disk full"}));
        assert_eq!(cb.status, JobOutcome::Failure);
        assert_eq!(cb.result["raw"], "disk full");
    }

    #[test]
    fn test_job_callback_only_success_status_succeeds() {
        for status in ["KILLED", "CANCELLED", "WARNING", "FAILED", "success"] {
            let cb = JobCallback::from_payload(json!({"status": status}));
            assert_eq!(cb.status, JobOutcome::Failure, "{status}");
        }
        assert_eq!(
            JobCallback::from_payload(json!({"status": "SUCCESS"})).status,
            JobOutcome::Success
        );
        assert_eq!(
            JobCallback::from_payload(json!({"status": null, "rows": 1})).status,
            JobOutcome::Success
        );
    }
}
