//! HTTP request handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{parse_dtype, Device};
use crate::error::BerthError;
use crate::lifecycle::{LoadOptions, LoadedModelInfo, ModelLoader, ModelManager, ModelStatus};
use crate::queue::{QueueManager, QueueStats, RequestId, RequestState, Role, StatusReport};

/// Shared application state
pub struct AppState<L: ModelLoader> {
    pub queue: Arc<QueueManager>,
    pub models: ModelManager<L>,
}

impl<L: ModelLoader> AppState<L> {
    pub fn new(queue: Arc<QueueManager>, models: ModelManager<L>) -> Self {
        Self { queue, models }
    }
}

/// Error returned by every handler
#[derive(Debug)]
pub enum ApiError {
    Berth(BerthError),
    BadRequest(String),
    Conflict(String),
}

impl From<BerthError> for ApiError {
    fn from(err: BerthError) -> Self {
        ApiError::Berth(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, kind) = match self {
            ApiError::Berth(err) => {
                let status = StatusCode::from_u16(err.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, err.to_string(), err.kind().to_string())
            }
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, message, "invalid_request_error".to_string())
            }
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message, "conflict".to_string()),
        };

        if status.is_server_error() {
            tracing::warn!(%status, error = %message, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    message,
                    r#type: kind,
                },
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Admit a request into the queue
pub async fn submit_request<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let role = request
        .role
        .as_deref()
        .map(Role::lenient)
        .unwrap_or(Role::Guest);

    let id = state
        .queue
        .enqueue(
            &request.submitter_id,
            role,
            &request.kind,
            request.payload,
            request.priority_boost,
        )
        .await?;
    // A fast worker may already have claimed it
    let position = state.queue.get_queue_position(id).await.ok().flatten();

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            id,
            status: RequestState::Queued,
            position,
        }),
    ))
}

pub async fn get_request<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<RequestId>,
) -> ApiResult<StatusReport> {
    Ok(Json(state.queue.get_status(id).await?))
}

pub async fn get_position<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<RequestId>,
) -> ApiResult<PositionResponse> {
    let position = state.queue.get_queue_position(id).await?;
    Ok(Json(PositionResponse { id, position }))
}

/// Cancel a queued request; 409 once it has been claimed or finished
pub async fn cancel_request<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
    Path(id): Path<RequestId>,
) -> ApiResult<CancelResponse> {
    if state.queue.cancel(id).await? {
        Ok(Json(CancelResponse {
            id,
            cancelled: true,
        }))
    } else {
        Err(ApiError::Conflict(format!(
            "request {} is already in flight or finished",
            id
        )))
    }
}

pub async fn queue_stats<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
) -> ApiResult<QueueStats> {
    Ok(Json(state.queue.get_queue_stats().await?))
}

/// Registry entries with their residency, plus details of loaded models
pub async fn list_models<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        object: "list".to_string(),
        data: state.models.list_models(),
        loaded: state.models.get_loaded_models(),
    })
}

/// Load a model ahead of demand
pub async fn load_model<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
    Path(name): Path<String>,
    Query(query): Query<LoadQuery>,
) -> ApiResult<ModelActionResponse> {
    let device = match query.device.as_deref() {
        Some(device) => device
            .parse::<Device>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => Device::Auto,
    };
    let dtype = query
        .dtype
        .as_deref()
        .map(parse_dtype)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let lease = state
        .models
        .get_model(&name, LoadOptions { device, dtype })
        .await?;
    drop(lease);

    Ok(Json(ModelActionResponse {
        model: name,
        loaded: true,
    }))
}

/// Unload a model; 409 while it is leased. `unloaded` is false when the
/// model was not resident to begin with.
pub async fn unload_model<L: ModelLoader>(
    State(state): State<Arc<AppState<L>>>,
    Path(name): Path<String>,
) -> ApiResult<UnloadResponse> {
    let unloaded = state.models.unload_model(&name).await?;
    Ok(Json(UnloadResponse {
        model: name,
        unloaded,
    }))
}

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub submitter_id: String,
    /// Unknown or missing roles are treated as guest
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority_boost: i64,
}

fn default_kind() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: RequestId,
    pub status: RequestState,
    pub position: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PositionResponse {
    pub id: RequestId,
    /// None once the request has left the queue
    pub position: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: RequestId,
    pub cancelled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoadQuery {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub dtype: Option<String>,
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelStatus>,
    pub loaded: BTreeMap<String, LoadedModelInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelActionResponse {
    pub model: String,
    pub loaded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub model: String,
    pub unloaded: bool,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
}
