//! HTTP surface for the onboarding engine.

pub mod settings;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use onboarding_core::{Delivery, InstanceStatus, OnboardingEngine, OnboardingError, Signal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<OnboardingEngine>,
}

// API types
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub game_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    pub workflow_id: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<OnboardingError> for ApiError {
    fn from(err: OnboardingError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.message))).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/onboarding/:game_id", get(instance_status))
        .route("/onboarding/:game_id/start", post(start_onboarding))
        .route("/onboarding/:game_id/cancel", post(cancel_onboarding))
        .route("/executions/:execution_id/signal", post(deliver_signal))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::ok("OK".to_string()))
}

async fn start_onboarding(
    Path(game_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowRef>>), ApiError> {
    if request.game_name.trim().is_empty() {
        return Err(OnboardingError::InvalidInput("gameName must not be empty".into()).into());
    }
    let workflow_id = state.engine.start(game_id, &request.game_name)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(WorkflowRef { workflow_id })),
    ))
}

async fn cancel_onboarding(
    Path(game_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowRef>>), ApiError> {
    let workflow_id = state.engine.cancel(game_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(WorkflowRef { workflow_id })),
    ))
}

async fn instance_status(
    Path(game_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<InstanceStatus>>, ApiError> {
    state
        .engine
        .status(game_id)
        .map(|status| Json(ApiResponse::ok(status)))
        .ok_or_else(|| OnboardingError::InstanceNotFound(game_id).into())
}

/// Human responses and job callbacks. The correlation id is the body's
/// `requestId`, falling back to the `x-request-id` header.
async fn deliver_signal(
    Path(execution_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<ApiResponse<Delivery>>), ApiError> {
    let mut signal = Signal::from_payload(payload);
    if signal.request_id.is_none() {
        if let Some(header) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
            signal = signal.with_request_id(header);
        }
    }

    let delivery = state.engine.signal(&execution_id, signal)?;
    let status = if delivery.is_delivered() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(ApiResponse::ok(delivery))))
}
