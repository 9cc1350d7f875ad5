//! Task API used by collaborators to submit and track background work

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use cadence_core::tasks::{Priority, Task, TaskArgs, TaskStatus, DEFAULT_MAX_RETRIES};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ServerError, ServerResult};
use crate::server::CadenceServer;

/// Request body for submitting a task
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    /// Handler name
    pub name: String,

    #[serde(default)]
    pub args: TaskArgs,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub owner_id: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Response for an accepted or cancelled task
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub id: String,
    pub status: TaskStatus,
}

/// Query parameters for listing tasks
#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub owner_id: Option<String>,
}

impl SubmitTaskRequest {
    fn into_task(self) -> Task {
        let mut task = Task::new(self.name, self.args)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries);
        if let Some(owner) = self.owner_id {
            task = task.with_owner(owner);
        }
        task.metadata = self.metadata;
        task
    }
}

/// POST /v1/tasks
pub async fn submit_task(
    State(server): State<Arc<CadenceServer>>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> ServerResult<impl IntoResponse> {
    let Json(request) = body.map_err(|e| ServerError::ValidationError(e.body_text()))?;

    if request.name.trim().is_empty() {
        return Err(ServerError::ValidationError("Task name must not be empty".to_string()));
    }
    if !server.registry().contains(&request.name) {
        debug!("Submitting task for unregistered handler {}", request.name);
    }

    let task = request.into_task();
    let id = server.tasks().enqueue(task).await?;
    info!(task_id = %id, "Task submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            id,
            status: TaskStatus::Pending,
        }),
    ))
}

/// GET /v1/tasks/:id
pub async fn get_task(State(server): State<Arc<CadenceServer>>, Path(id): Path<String>) -> ServerResult<Json<Task>> {
    match server.tasks().get(&id).await? {
        Some(task) => Ok(Json(task)),
        None => Err(ServerError::NotFound(format!("Task {}", id))),
    }
}

/// GET /v1/tasks?owner_id=...
pub async fn list_tasks(
    State(server): State<Arc<CadenceServer>>,
    Query(query): Query<ListTasksQuery>,
) -> ServerResult<impl IntoResponse> {
    let owner_id = query
        .owner_id
        .filter(|o| !o.trim().is_empty())
        .ok_or_else(|| ServerError::ValidationError("owner_id query parameter is required".to_string()))?;

    let tasks = server.tasks().list_by_owner(&owner_id).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

/// POST /v1/tasks/:id/cancel
pub async fn cancel_task(
    State(server): State<Arc<CadenceServer>>,
    Path(id): Path<String>,
) -> ServerResult<Json<TaskAccepted>> {
    if !server.tasks().cancel(&id).await? {
        return Err(ServerError::Conflict(format!("Task {} can no longer be cancelled", id)));
    }

    info!(task_id = %id, "Task cancelled");
    Ok(Json(TaskAccepted {
        id,
        status: TaskStatus::Cancelled,
    }))
}
