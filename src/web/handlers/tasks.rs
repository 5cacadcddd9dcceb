use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::queue::types::{TaskParameters, DEFAULT_MAX_RETRIES};
use crate::queue::{QueueError, TaskQueue};
use crate::web::Pagination;

pub fn task_router(queue: Arc<TaskQueue>) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:task_id", get(get_task_status).delete(cancel_task))
        .route("/task-types", get(list_task_types))
        .with_state(queue)
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    task_type: String,
    #[serde(default)]
    parameters: TaskParameters,
    task_id: Option<String>,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    task_id: String,
}

// Create task endpoint. Failure of the job itself is observed by polling the
// status endpoint, never as a failed HTTP call here.
async fn create_task(
    State(queue): State<Arc<TaskQueue>>,
    Json(req): Json<EnqueueRequest>,
) -> impl IntoResponse {
    match queue
        .enqueue(&req.task_type, req.parameters, req.task_id, req.max_retries)
        .await
    {
        Ok(task_id) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(EnqueueResponse { task_id })),
        ),
        Err(e @ QueueError::DuplicateTask(_)) => {
            (StatusCode::CONFLICT, Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => {
            error!("Failed to enqueue task: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    }
}

// Get task status endpoint
async fn get_task_status(
    State(queue): State<Arc<TaskQueue>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match queue.get_status(&task_id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(ApiResponse::success(snapshot))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("Task not found".to_string())),
        ),
        Err(e) => {
            error!("Failed to get task status: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

// Cancel task endpoint. A false `cancelled` means the task had already
// started or settled; that is not an error.
async fn cancel_task(
    State(queue): State<Arc<TaskQueue>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match queue.cancel(&task_id).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(ApiResponse::success(CancelResponse { cancelled })),
        ),
        Err(e) => {
            error!("Failed to cancel task {}: {}", task_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    }
}

// List tasks endpoint
async fn list_tasks(
    State(queue): State<Arc<TaskQueue>>,
    Query(pagination): Query<Pagination>,
) -> impl IntoResponse {
    match queue.list(&pagination).await {
        Ok(tasks) => (StatusCode::OK, Json(ApiResponse::success(tasks))),
        Err(e) => {
            error!("Failed to list tasks: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    }
}

// Registered task types, for health reporting
async fn list_task_types(State(queue): State<Arc<TaskQueue>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ApiResponse::success(queue.list_task_types())),
    )
}
