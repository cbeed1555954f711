//! Onboarding plan: the step catalog joined with a game's progress.
//!
//! The admin API returns loosely typed step records. [`OnboardingPlan::from_snapshot`]
//! turns them into a validated plan: every executor kind is known, every
//! executor config parses, and every platform activity names a registered
//! handler. Nothing downstream has to re-check those facts.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::duration::HumanDuration;
use crate::platform::ActivityRegistry;
use crate::types::{PlatformConfig, StepStatus};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("step '{slug}': unknown executor kind '{kind}'")]
    UnknownExecutorKind { slug: String, kind: String },

    #[error("step '{slug}': invalid {kind} config: {message}")]
    InvalidExecutorConfig {
        slug: String,
        kind: &'static str,
        message: String,
    },

    #[error("step '{slug}': platform activity '{name}' is not registered")]
    UnknownActivity { slug: String, name: String },

    #[error("duplicate step slug '{0}'")]
    DuplicateSlug(String),
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// One step as returned by the plan query: catalog fields plus progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStepRecord {
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub executor_kind: String,
    #[serde(default)]
    pub executor_config: Value,
    /// Absent progress reads as pending.
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshot {
    #[serde(alias = "onboarding")]
    pub steps: Vec<PlanStepRecord>,
    #[serde(default, alias = "configs")]
    pub platform_configs: Vec<PlatformConfig>,
}

// ---------------------------------------------------------------------------
// Executor configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvImportConfig {
    #[serde(default)]
    pub label: Option<String>,
    pub target_table: String,
    #[serde(default)]
    pub expected_columns: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalJobConfig {
    #[serde(alias = "flowId")]
    pub job_id: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub timeout: Option<HumanDuration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "formSchema")]
    pub fields: Vec<Value>,
    #[serde(default)]
    pub target_table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformActivityConfig {
    pub activity_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// How a step gets executed.
#[derive(Debug, Clone, PartialEq)]
pub enum StepExecutor {
    Script(Value),
    Form(FormConfig),
    ExternalJob(ExternalJobConfig),
    CsvImport(CsvImportConfig),
    PlatformActivity(PlatformActivityConfig),
    Manual,
}

impl StepExecutor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Script(_) => "script",
            Self::Form(_) => "form",
            Self::ExternalJob(_) => "external_job",
            Self::CsvImport(_) => "csv_import",
            Self::PlatformActivity(_) => "platform_activity",
            Self::Manual => "manual",
        }
    }

    /// Build an executor from its wire kind and raw config.
    ///
    /// Kind matching ignores case, `_` and `-`, so `csvImport`, `csv_import`
    /// and `CSV-IMPORT` are the same kind.
    pub fn from_parts(slug: &str, kind: &str, config: &Value) -> Result<Self, CatalogError> {
        let normalized: String = kind
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        let config = match config {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let executor = match normalized.as_str() {
            "script" => Self::Script(config),
            "manual" => Self::Manual,
            "form" => Self::Form(parse_config(slug, "form", config)?),
            "externaljob" => Self::ExternalJob(parse_config(slug, "external_job", config)?),
            "csvimport" => Self::CsvImport(parse_config(slug, "csv_import", config)?),
            "platformactivity" => {
                Self::PlatformActivity(parse_config(slug, "platform_activity", config)?)
            }
            _ => {
                return Err(CatalogError::UnknownExecutorKind {
                    slug: slug.to_string(),
                    kind: kind.to_string(),
                })
            }
        };
        Ok(executor)
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(
    slug: &str,
    kind: &'static str,
    config: Value,
) -> Result<T, CatalogError> {
    serde_json::from_value(config).map_err(|e| CatalogError::InvalidExecutorConfig {
        slug: slug.to_string(),
        kind,
        message: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Validated plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub slug: String,
    pub title: String,
    pub platform: Option<String>,
    pub order: i32,
    /// Informational only; execution order comes from `order` within a platform group.
    pub depends_on: Vec<String>,
    pub executor: StepExecutor,
    pub status: StepStatus,
}

/// Compact view of a step shown to the reviewer of the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub slug: String,
    pub title: String,
    pub platform: Option<String>,
    pub order: i32,
    pub executor_kind: String,
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn summary(&self) -> StepSummary {
        StepSummary {
            slug: self.slug.clone(),
            title: self.title.clone(),
            platform: self.platform.clone(),
            order: self.order,
            executor_kind: self.executor.kind().to_string(),
            depends_on: self.depends_on.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnboardingPlan {
    steps: Vec<PlanStep>,
    platform_configs: Vec<PlatformConfig>,
}

impl OnboardingPlan {
    pub fn from_snapshot(
        snapshot: PlanSnapshot,
        registry: &ActivityRegistry,
    ) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(snapshot.steps.len());

        for record in snapshot.steps {
            if !seen.insert(record.slug.clone()) {
                return Err(CatalogError::DuplicateSlug(record.slug));
            }
            let executor =
                StepExecutor::from_parts(&record.slug, &record.executor_kind, &record.executor_config)?;
            if let StepExecutor::PlatformActivity(cfg) = &executor {
                if !registry.contains(&cfg.activity_name) {
                    return Err(CatalogError::UnknownActivity {
                        slug: record.slug,
                        name: cfg.activity_name.clone(),
                    });
                }
            }
            steps.push(PlanStep {
                title: if record.title.is_empty() {
                    record.slug.clone()
                } else {
                    record.title
                },
                slug: record.slug,
                platform: record.platform.filter(|p| !p.is_empty()),
                order: record.order,
                depends_on: record.depends_on,
                executor,
                status: record.status.unwrap_or_default(),
            });
        }
        steps.sort_by_key(|s| s.order);

        Ok(Self {
            steps,
            platform_configs: snapshot.platform_configs,
        })
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn platform_configs(&self) -> &[PlatformConfig] {
        &self.platform_configs
    }

    pub fn platform_config(&self, slug: &str) -> Option<&PlatformConfig> {
        self.platform_configs.iter().find(|c| c.slug == slug)
    }

    /// Steps a new run has to look at: everything not completed or skipped.
    pub fn steps_to_process(&self) -> Vec<PlanStep> {
        self.steps
            .iter()
            .filter(|s| !s.status.is_resolved())
            .cloned()
            .collect()
    }
}

/// Distinct non-empty platforms, in order of first appearance.
pub fn distinct_platforms(steps: &[PlanStep]) -> Vec<String> {
    let mut seen = HashSet::new();
    steps
        .iter()
        .filter_map(|s| s.platform.clone())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Steps sharing a platform. `platform == None` is the global group.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformGroup {
    pub platform: Option<String>,
    pub steps: Vec<PlanStep>,
}

impl PlatformGroup {
    pub fn label(&self) -> &str {
        self.platform.as_deref().unwrap_or("global")
    }
}

/// Partition steps by platform, keeping first-appearance group order and
/// ascending `order` inside each group.
pub fn group_by_platform(steps: &[PlanStep]) -> Vec<PlatformGroup> {
    let mut groups: Vec<PlatformGroup> = Vec::new();
    for step in steps {
        match groups.iter_mut().find(|g| g.platform == step.platform) {
            Some(group) => group.steps.push(step.clone()),
            None => groups.push(PlatformGroup {
                platform: step.platform.clone(),
                steps: vec![step.clone()],
            }),
        }
    }
    for group in &mut groups {
        group.steps.sort_by_key(|s| s.order);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(steps: Value) -> PlanSnapshot {
        serde_json::from_value(json!({ "steps": steps })).unwrap()
    }

    #[test]
    fn test_from_snapshot_parses_every_kind() {
        let snap = snapshot(json!([
            {"slug": "players", "platform": "steam", "order": 2, "executorKind": "csv_import",
             "executorConfig": {"targetTable": "players", "expectedColumns": ["id", "name"]}},
            {"slug": "sync", "platform": "steam", "order": 1, "executorKind": "externalJob",
             "executorConfig": {"jobId": "steam-sync", "timeout": "30 minutes"}},
            {"slug": "tax", "executorKind": "FORM", "executorConfig": {"title": "Tax"}},
            {"slug": "kick", "executorKind": "platform-activity",
             "executorConfig": {"activityName": "trigger_step"}},
            {"slug": "notes", "executorKind": "manual", "status": "completed"},
            {"slug": "lint", "executorKind": "script"}
        ]));
        let plan = OnboardingPlan::from_snapshot(snap, &ActivityRegistry::with_builtins()).unwrap();

        assert_eq!(plan.steps().len(), 6);
        let sync = plan.steps().iter().find(|s| s.slug == "sync").unwrap();
        match &sync.executor {
            StepExecutor::ExternalJob(cfg) => {
                assert_eq!(
                    cfg.timeout.map(|t| t.get()),
                    Some(std::time::Duration::from_secs(1_800))
                );
            }
            other => panic!("expected external job, got {other:?}"),
        }
        assert_eq!(plan.steps_to_process().len(), 5);
    }

    #[test]
    fn test_unknown_activity_rejected_at_load() {
        let snap = snapshot(json!([
            {"slug": "kick", "executorKind": "platform_activity",
             "executorConfig": {"activityName": "launch_rockets"}}
        ]));
        let err = OnboardingPlan::from_snapshot(snap, &ActivityRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownActivity { name, .. } if name == "launch_rockets"));
    }

    #[test]
    fn test_invalid_config_and_kind_rejected() {
        let bad_cfg = snapshot(json!([
            {"slug": "players", "executorKind": "csv_import", "executorConfig": {}}
        ]));
        assert!(matches!(
            OnboardingPlan::from_snapshot(bad_cfg, &ActivityRegistry::with_builtins()),
            Err(CatalogError::InvalidExecutorConfig { kind: "csv_import", .. })
        ));

        let bad_kind = snapshot(json!([{"slug": "x", "executorKind": "teleport"}]));
        assert!(matches!(
            OnboardingPlan::from_snapshot(bad_kind, &ActivityRegistry::with_builtins()),
            Err(CatalogError::UnknownExecutorKind { .. })
        ));

        let dup = snapshot(json!([
            {"slug": "x", "executorKind": "manual"},
            {"slug": "x", "executorKind": "manual"}
        ]));
        assert_eq!(
            OnboardingPlan::from_snapshot(dup, &ActivityRegistry::with_builtins()).unwrap_err(),
            CatalogError::DuplicateSlug("x".into())
        );
    }

    #[test]
    fn test_grouping_and_platform_order() {
        let snap = snapshot(json!([
            {"slug": "a", "platform": "steam", "order": 3, "executorKind": "manual"},
            {"slug": "b", "order": 1, "executorKind": "manual"},
            {"slug": "c", "platform": "epic", "order": 2, "executorKind": "manual"},
            {"slug": "d", "platform": "steam", "order": 0, "executorKind": "manual"},
            {"slug": "e", "platform": "", "order": 4, "executorKind": "manual"}
        ]));
        let plan = OnboardingPlan::from_snapshot(snap, &ActivityRegistry::with_builtins()).unwrap();
        let steps = plan.steps_to_process();

        assert_eq!(distinct_platforms(&steps), vec!["steam", "epic"]);

        let groups = group_by_platform(&steps);
        let labels: Vec<_> = groups.iter().map(|g| g.label().to_string()).collect();
        assert_eq!(labels, vec!["steam", "global", "epic"]);
        let steam: Vec<_> = groups[0].steps.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(steam, vec!["d", "a"]);
        let global: Vec<_> = groups[1].steps.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(global, vec!["b", "e"]);
    }

    #[test]
    fn test_snapshot_accepts_admin_aliases() {
        let snap: PlanSnapshot = serde_json::from_value(json!({
            "onboarding": [{"slug": "x", "executorKind": "manual", "status": null}],
            "configs": [{"platformSlug": "steam", "configSchema": ["apiKey"]}]
        }))
        .unwrap();
        let plan = OnboardingPlan::from_snapshot(snap, &ActivityRegistry::with_builtins()).unwrap();
        assert_eq!(plan.steps()[0].status, StepStatus::Pending);
        assert_eq!(
            plan.platform_config("steam").unwrap().missing_fields(),
            vec!["apiKey"]
        );
    }
}
