//! Engine configuration.
//!
//! Loaded from an optional YAML file, then overridden field by field from
//! the environment. Every field has a default, so an empty file (or no file)
//! is a valid configuration for local runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activities::{ActivityOptions, RetryPolicy};
use crate::duration::{self, HumanDuration};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("environment variable {var}: {message}")]
    InvalidEnv { var: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRunnerSettings {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff: HumanDuration,
    pub backoff_coefficient: f64,
    pub max_backoff: HumanDuration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1).into(),
            backoff_coefficient: 2.0,
            max_backoff: Duration::from_secs(30).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_url: String,
    /// Identity sent as `x-user-id` on every admin call.
    pub system_user_id: Option<String>,
    pub job_runner: JobRunnerSettings,

    pub activity_timeout: HumanDuration,
    pub retry: RetrySettings,

    pub default_job_timeout: HumanDuration,
    pub default_job_namespace: String,
    pub csv_job_id: String,
    pub csv_job_namespace: String,

    /// Upper bound on a human wait. Unset means wait indefinitely.
    pub human_gate_timeout: Option<HumanDuration>,
    /// Log a reminder this often while a human wait is outstanding.
    pub human_reminder_interval: Option<HumanDuration>,

    /// Raise one config request covering every platform instead of one per platform.
    pub batch_config_validation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".to_string(),
            system_user_id: None,
            job_runner: JobRunnerSettings::default(),
            activity_timeout: Duration::from_secs(60).into(),
            retry: RetrySettings::default(),
            default_job_timeout: Duration::from_secs(3_600).into(),
            default_job_namespace: "lovelace".to_string(),
            csv_job_id: "csv-ingestion".to_string(),
            csv_job_namespace: "lovelace.ingestion".to_string(),
            human_gate_timeout: None,
            human_reminder_interval: None,
            batch_config_validation: false,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// `ONBOARDING_CONFIG` file (if set) plus process environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ONBOARDING_CONFIG") {
            Ok(path) if !path.is_empty() => Self::load_from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`. Empty values are ignored.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

        if let Some(v) = get("API_URL") {
            self.api_url = v;
        }
        if let Some(v) = get("SYSTEM_USER_ID") {
            self.system_user_id = Some(v);
        }
        if let Some(v) = get("JOB_RUNNER_URL") {
            self.job_runner.url = Some(v);
        }
        if let Some(v) = get("JOB_RUNNER_USER") {
            self.job_runner.user = Some(v);
        }
        if let Some(v) = get("JOB_RUNNER_PASSWORD") {
            self.job_runner.password = Some(v);
        }
        if let Some(v) = get("ACTIVITY_TIMEOUT") {
            self.activity_timeout = parse_env_duration("ACTIVITY_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DEFAULT_JOB_TIMEOUT") {
            self.default_job_timeout = parse_env_duration("DEFAULT_JOB_TIMEOUT", &v)?;
        }
        if let Some(v) = get("HUMAN_GATE_TIMEOUT") {
            self.human_gate_timeout = Some(parse_env_duration("HUMAN_GATE_TIMEOUT", &v)?);
        }
        if let Some(v) = get("HUMAN_REMINDER_INTERVAL") {
            self.human_reminder_interval =
                Some(parse_env_duration("HUMAN_REMINDER_INTERVAL", &v)?);
        }
        if let Some(v) = get("BATCH_CONFIG_VALIDATION") {
            self.batch_config_validation = match v.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "BATCH_CONFIG_VALIDATION",
                        message: format!("expected a boolean, got '{v}'"),
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_coefficient < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_coefficient must be >= 1.0".into(),
            ));
        }
        if self.activity_timeout.get().is_zero() {
            return Err(ConfigError::Invalid("activity_timeout must be positive".into()));
        }
        if self.default_job_timeout.get().is_zero() {
            return Err(ConfigError::Invalid("default_job_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn activity_options(&self) -> ActivityOptions {
        ActivityOptions {
            start_to_close: self.activity_timeout.get(),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: self.retry.initial_backoff.get(),
                backoff_coefficient: self.retry.backoff_coefficient,
                max_backoff: self.retry.max_backoff.get(),
            },
        }
    }
}

fn parse_env_duration(var: &'static str, value: &str) -> Result<HumanDuration, ConfigError> {
    duration::parse(value)
        .map(HumanDuration)
        .map_err(|e| ConfigError::InvalidEnv {
            var,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.activity_timeout.get(), Duration::from_secs(60));
        assert_eq!(config.default_job_timeout.get(), Duration::from_secs(3_600));
        assert_eq!(config.default_job_namespace, "lovelace");
        assert_eq!(config.csv_job_id, "csv-ingestion");
        assert_eq!(config.csv_job_namespace, "lovelace.ingestion");
        assert!(config.human_gate_timeout.is_none());
        assert!(!config.batch_config_validation);

        let options = config.activity_options();
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.retry.initial_backoff, Duration::from_secs(1));
        assert_eq!(options.retry.max_backoff, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
api_url: http://admin:4000
activity_timeout: 10s
default_job_timeout: 30 minutes
retry:
  max_attempts: 3
job_runner:
  url: http://runner:8080
human_reminder_interval: 1 hour
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.api_url, "http://admin:4000");
        assert_eq!(config.activity_timeout.get(), Duration::from_secs(10));
        assert_eq!(config.default_job_timeout.get(), Duration::from_secs(1_800));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_coefficient, 2.0);
        assert_eq!(config.job_runner.url.as_deref(), Some("http://runner:8080"));
        assert_eq!(
            config.human_reminder_interval.map(|d| d.get()),
            Some(Duration::from_secs(3_600))
        );
        assert_eq!(EngineConfig::from_yaml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("API_URL", "http://api"),
            ("SYSTEM_USER_ID", "svc-onboarding"),
            ("JOB_RUNNER_URL", "http://runner"),
            ("JOB_RUNNER_USER", "admin"),
            ("JOB_RUNNER_PASSWORD", ""),
            ("HUMAN_GATE_TIMEOUT", "2d"),
            ("BATCH_CONFIG_VALIDATION", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api_url, "http://api");
        assert_eq!(config.system_user_id.as_deref(), Some("svc-onboarding"));
        assert_eq!(config.job_runner.user.as_deref(), Some("admin"));
        assert_eq!(config.job_runner.password, None);
        assert_eq!(
            config.human_gate_timeout.map(|d| d.get()),
            Some(Duration::from_secs(172_800))
        );
        assert!(config.batch_config_validation);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|k| (k == "ACTIVITY_TIMEOUT").then(|| "whenever".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "ACTIVITY_TIMEOUT", .. }));

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = EngineConfig::load_from_file(Path::new("/nonexistent/onboarding.yaml"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/onboarding.yaml"));
    }
}
