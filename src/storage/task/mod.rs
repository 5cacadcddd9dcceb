use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::queue::error::QueueError;
use crate::queue::types::{BackgroundTask, TaskStatus};
use crate::web::Pagination;

pub mod sqlite;

pub use sqlite::SqliteTaskRepository;

/// Partial update applied to one task row.
///
/// `started_at` and `completed_at` are set-once: a patch never rewrites a
/// timestamp that is already present. `error_message` distinguishes "leave
/// untouched" (`None`) from "clear" (`Some(None)`) so a task that failed and
/// then succeeded ends up with a result and no stale error.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub retry_count: Option<u32>,
    pub result: Option<Value>,
    pub error_message: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn apply(&self, task: &mut BackgroundTask) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(error_message) = &self.error_message {
            task.error_message = error_message.clone();
        }
        if let Some(started_at) = self.started_at {
            if task.started_at.is_none() {
                task.started_at = Some(started_at);
            }
        }
        if let Some(completed_at) = self.completed_at {
            if task.completed_at.is_none() {
                task.completed_at = Some(completed_at);
            }
        }
    }
}

/// Durable, atomic storage for task records.
///
/// Every mutation is a read-modify-write inside one transaction: once a call
/// returns Ok the change is durable and visible to any subsequent
/// `get_by_id`; on failure the prior state is left untouched. Updates to
/// different tasks never block each other.
#[async_trait]
pub trait TaskRepository: Send + Sync + 'static {
    /// Persists a new task. Fails with `DuplicateTask` when the task_id is
    /// already in use; the existing row is left unmodified.
    async fn add(&self, task: &BackgroundTask) -> Result<String, QueueError>;

    async fn get_by_id(&self, task_id: &str) -> Result<Option<BackgroundTask>, QueueError>;

    /// Applies a partial update. `TaskNotFound` when the row is absent.
    async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<(), QueueError>;

    /// Applies the patch only when the task's current status is one of
    /// `from`; returns whether it applied. Missing rows and status mismatches
    /// both report `false`. This is the primitive that keeps per-task status
    /// transitions totally ordered.
    async fn transition(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        patch: TaskPatch,
    ) -> Result<bool, QueueError>;

    /// Task summaries in creation order.
    async fn list(&self, pagination: &Pagination) -> Result<Vec<BackgroundTask>, QueueError>;
}
