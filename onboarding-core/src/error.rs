use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::catalog::CatalogError;

/// Failure reported by an [`OnboardingBackend`](crate::backend::OnboardingBackend) call.
///
/// Retry decisions are made from the variant alone: transport problems,
/// 5xx/429 responses and per-call timeouts are retried, everything else is
/// surfaced immediately.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("service unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Unavailable { .. } | Self::Timeout(_)
        )
    }

    /// Classify an HTTP status code returned by a downstream service.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status >= 500 || status == 429 || status == 408 {
            Self::Unavailable { status, body }
        } else {
            Self::Rejected { status, body }
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("onboarding already running for game {game_id} ({workflow_id})")]
    AlreadyRunning { game_id: Uuid, workflow_id: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("no onboarding instance for game {0}")]
    InstanceNotFound(Uuid),

    #[error("activity {activity} failed after {attempts} attempt(s): {source}")]
    Activity {
        activity: &'static str,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("unknown platform activity '{0}'")]
    UnknownActivity(String),

    #[error("external job {job_id} for step {step_slug} returned FAILED ({execution_id})")]
    JobFailed {
        step_slug: String,
        job_id: String,
        execution_id: String,
    },

    #[error("external job {job_id} for step {step_slug} timed out after {timeout:?}")]
    JobTimedOut {
        step_slug: String,
        job_id: String,
        timeout: Duration,
    },

    #[error("{gate} not answered within {timeout:?}")]
    HumanGateTimeout { gate: String, timeout: Duration },

    #[error("all {0} platform group(s) failed")]
    AllGroupsFailed(usize),

    #[error("execution cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl OnboardingError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AlreadyRunning { .. } => 409,
            Self::ExecutionNotFound(_) | Self::InstanceNotFound(_) => 404,
            Self::InvalidInput(_) => 400,
            Self::Catalog(_) | Self::UnknownActivity(_) => 422,
            Self::Activity { .. } => 502,
            Self::JobFailed { .. } | Self::JobTimedOut { .. } | Self::HumanGateTimeout { .. } => {
                504
            }
            Self::Cancelled => 499,
            Self::AllGroupsFailed(_) | Self::Internal(_) => 500,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the failing pattern already wrote the step's terminal status.
    pub fn status_recorded(&self) -> bool {
        matches!(self, Self::JobFailed { .. } | Self::JobTimedOut { .. })
    }
}

pub type Result<T, E = OnboardingError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_retry_classification() {
        assert!(BackendError::Transport("reset".into()).is_retryable());
        assert!(BackendError::from_status(503, "down").is_retryable());
        assert!(BackendError::from_status(429, "slow down").is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(60)).is_retryable());

        assert!(!BackendError::from_status(404, "missing").is_retryable());
        assert!(!BackendError::from_status(422, "bad").is_retryable());
        assert!(!BackendError::Decode("eof".into()).is_retryable());
        assert!(!BackendError::Failed("boom".into()).is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        let running = OnboardingError::AlreadyRunning {
            game_id: Uuid::nil(),
            workflow_id: "onboarding-x".into(),
        };
        assert_eq!(running.http_status(), 409);
        assert_eq!(
            OnboardingError::ExecutionNotFound("x".into()).http_status(),
            404
        );
        assert_eq!(OnboardingError::InvalidInput("x".into()).http_status(), 400);
    }

    #[test]
    fn test_status_recorded_only_for_job_outcomes() {
        let failed = OnboardingError::JobFailed {
            step_slug: "s".into(),
            job_id: "j".into(),
            execution_id: "e".into(),
        };
        assert!(failed.status_recorded());
        assert!(!OnboardingError::Cancelled.status_recorded());
        assert!(OnboardingError::Cancelled.is_cancellation());
    }
}
