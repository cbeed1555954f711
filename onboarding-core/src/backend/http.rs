//! Admin API and job runner over HTTP.
//!
//! Every admin call carries the system identity in `x-user-id`. Job triggers
//! go to the runner as multipart form inputs with `labels=key:value` query
//! parameters and optional basic auth.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::OnboardingBackend;
use crate::catalog::PlanSnapshot;
use crate::config::EngineConfig;
use crate::error::BackendError;
use crate::types::{JobExecution, JobTrigger, NewRequest, StatusUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRunnerEndpoint {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    api_url: String,
    system_user_id: Option<String>,
    job_runner: Option<JobRunnerEndpoint>,
}

#[derive(Deserialize)]
struct CreatedRequest {
    #[serde(alias = "requestId")]
    id: Uuid,
}

#[derive(Deserialize)]
struct PlatformsResponse {
    #[serde(default)]
    integrations: Vec<Integration>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Integration {
    platform_slug: String,
    #[serde(default)]
    config: Map<String, Value>,
}

#[derive(Deserialize)]
struct CancelledRequests {
    #[serde(default)]
    cancelled: u64,
}

impl HttpBackend {
    pub fn new(config: &EngineConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.activity_timeout.get() + Duration::from_secs(5))
            .build()?;
        let job_runner = config.job_runner.url.as_ref().map(|url| JobRunnerEndpoint {
            url: url.clone(),
            user: config.job_runner.user.clone(),
            password: config.job_runner.password.clone(),
        });
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            system_user_id: config.system_user_id.clone(),
            job_runner,
        })
    }

    fn admin(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, format!("{}{}", self.api_url, path));
        match &self.system_user_id {
            Some(user) => request.header("x-user-id", user),
            None => request,
        }
    }

    fn runner(&self) -> Result<&JobRunnerEndpoint, BackendError> {
        self.job_runner
            .as_ref()
            .ok_or_else(|| BackendError::NotConfigured("job runner url".into()))
    }
}

async fn send(request: RequestBuilder) -> Result<reqwest::Response, BackendError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status.as_u16(), body))
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, BackendError> {
    send(request)
        .await?
        .json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

/// Runner inputs are form fields, so non-string values go over as JSON text.
fn input_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn label_query(trigger: &JobTrigger) -> Vec<(&'static str, String)> {
    trigger
        .labels
        .iter()
        .map(|(k, v)| ("labels", format!("{k}:{v}")))
        .collect()
}

fn execution_url(runner: &JobRunnerEndpoint, trigger: &JobTrigger) -> String {
    format!(
        "{}/api/v1/executions/{}/{}",
        runner.url.trim_end_matches('/'),
        trigger.namespace,
        trigger.job_id
    )
}

#[async_trait]
impl OnboardingBackend for HttpBackend {
    async fn get_plan(&self, game_id: Uuid) -> Result<PlanSnapshot, BackendError> {
        send_json(self.admin(Method::GET, &format!("/admin/onboarding/{game_id}"))).await
    }

    async fn update_step_status(&self, update: &StatusUpdate) -> Result<(), BackendError> {
        let path = format!(
            "/admin/onboarding/{}/{}/complete",
            update.game_id, update.step_slug
        );
        send(self.admin(Method::POST, &path).json(update)).await?;
        Ok(())
    }

    async fn create_request(&self, request: &NewRequest) -> Result<Uuid, BackendError> {
        let created: CreatedRequest = send_json(
            self.admin(Method::POST, "/admin/onboarding/requests/create")
                .json(request),
        )
        .await?;
        Ok(created.id)
    }

    async fn cancel_pending_requests(&self, game_id: Uuid) -> Result<u64, BackendError> {
        let path = format!("/admin/onboarding/{game_id}/requests/cancel");
        let response: CancelledRequests = send_json(self.admin(Method::POST, &path)).await?;
        Ok(response.cancelled)
    }

    async fn get_platform_config(
        &self,
        game_id: Uuid,
        platform_slug: &str,
    ) -> Result<Map<String, Value>, BackendError> {
        let path = format!("/admin/games/{game_id}/platforms");
        let response: PlatformsResponse = send_json(self.admin(Method::GET, &path)).await?;
        Ok(response
            .integrations
            .into_iter()
            .find(|i| i.platform_slug == platform_slug)
            .map(|i| i.config)
            .unwrap_or_default())
    }

    async fn trigger_step(&self, game_id: Uuid, step_slug: &str) -> Result<Value, BackendError> {
        let path = format!("/admin/onboarding/{game_id}/{step_slug}/trigger");
        send_json(self.admin(Method::POST, &path)).await
    }

    async fn trigger_external_job(
        &self,
        trigger: &JobTrigger,
    ) -> Result<JobExecution, BackendError> {
        let runner = self.runner()?;
        let form = trigger
            .inputs
            .iter()
            .fold(reqwest::multipart::Form::new(), |form, (k, v)| {
                form.text(k.clone(), input_text(v))
            });
        let mut request = self
            .client
            .post(execution_url(runner, trigger))
            .query(&label_query(trigger))
            .multipart(form);
        if let Some(user) = &runner.user {
            request = request.basic_auth(user, runner.password.as_ref());
        }
        send_json(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn trigger() -> JobTrigger {
        let mut labels = BTreeMap::new();
        labels.insert("game_id".to_string(), "g1".to_string());
        labels.insert("platform".to_string(), "global".to_string());
        let mut inputs = Map::new();
        inputs.insert("gameId".into(), json!("g1"));
        inputs.insert("mapping".into(), json!({"a": "b"}));
        JobTrigger {
            job_id: "csv-ingestion".into(),
            namespace: "lovelace.ingestion".into(),
            correlation_id: "external-job-g1-players".into(),
            inputs,
            labels,
        }
    }

    #[test]
    fn test_execution_url_and_labels() {
        let runner = JobRunnerEndpoint {
            url: "http://runner:8080/".into(),
            user: None,
            password: None,
        };
        let t = trigger();
        assert_eq!(
            execution_url(&runner, &t),
            "http://runner:8080/api/v1/executions/lovelace.ingestion/csv-ingestion"
        );
        assert_eq!(
            label_query(&t),
            vec![
                ("labels", "game_id:g1".to_string()),
                ("labels", "platform:global".to_string())
            ]
        );
    }

    #[test]
    fn test_input_text_serializes_non_strings() {
        assert_eq!(input_text(&json!("plain")), "plain");
        assert_eq!(input_text(&json!({"a": "b"})), r#"{"a":"b"}"#);
        assert_eq!(input_text(&json!(3)), "3");
    }

    #[tokio::test]
    async fn test_job_trigger_without_runner_is_not_configured() {
        let mut config = EngineConfig::default();
        config.job_runner.url = None;
        let backend = HttpBackend::new(&config).unwrap();
        let err = backend.trigger_external_job(&trigger()).await.unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured(_)));
        assert!(!err.is_retryable());
    }
}
