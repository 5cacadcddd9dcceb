use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::queue::error::QueueError;
use crate::queue::registry::HandlerRegistry;
use crate::queue::types::{BackgroundTask, TaskStatus};
use crate::storage::task::{TaskPatch, TaskRepository};

/// Persistence faults get their own short bounded retry, separate from
/// task-level retries.
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(200);

/// States a worker may claim a task from.
static CLAIMABLE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Queued];

/// Runs one task to a terminal state: claims it, dispatches to its handler,
/// retries with exponential backoff, and records the outcome.
///
/// The backoff between attempts is `backoff_unit * 2^retry_count` with no
/// jitter, matching the source behavior this service replaces. The unit
/// defaults to one second; tests shrink it to exercise real retries quickly.
pub struct TaskExecutor {
    registry: Arc<HandlerRegistry>,
    repository: Arc<dyn TaskRepository>,
    backoff_unit: Duration,
}

impl TaskExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            registry,
            repository,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Drives the task to completion. Never propagates an error to the
    /// caller: handler failures land on the task record, and an unresolvable
    /// persistence fault leaves the task in its last persisted state for
    /// out-of-band reconciliation.
    pub async fn execute(&self, task_id: &str) {
        if let Err(e) = self.run(task_id).await {
            error!(
                "Giving up on task {}: {}; leaving last persisted state for reconciliation",
                task_id, e
            );
        }
    }

    async fn run(&self, task_id: &str) -> Result<(), QueueError> {
        let Some(mut task) = self.persist(|| self.repository.get_by_id(task_id)).await? else {
            warn!("Task {} scheduled but not found in storage", task_id);
            return Ok(());
        };

        loop {
            if !self.claim(&task).await? {
                info!(
                    "Task {} is no longer runnable (cancelled or already settled)",
                    task.task_id
                );
                return Ok(());
            }

            let Some(handler) = self.registry.get_handler(&task.task_type) else {
                // terminal, no retry: a missing handler will not appear by
                // waiting
                let err = QueueError::HandlerNotFound(task.task_type.clone());
                self.settle_failed(&task, err.to_string()).await?;
                return Ok(());
            };

            info!(
                "Executing task {} (type: {}, attempt {}/{})",
                task.task_id,
                task.task_type,
                task.retry_count + 1,
                task.max_retries + 1
            );

            match handler.run(&task.parameters).await {
                Ok(result) => {
                    self.settle_completed(&task, result).await?;
                    return Ok(());
                }
                Err(e) => {
                    let message = QueueError::HandlerExecution(format!("{:#}", e)).to_string();
                    if task.retry_count < task.max_retries {
                        task.retry_count += 1;
                        self.requeue_for_retry(&task, message).await?;
                        let backoff = self.backoff_unit * 2u32.saturating_pow(task.retry_count);
                        info!(
                            "Retry {}/{} for task {} in {:?}",
                            task.retry_count, task.max_retries, task.task_id, backoff
                        );
                        sleep(backoff).await;
                        // loop re-claims from Queued; a cancel that landed
                        // during the backoff window wins
                    } else {
                        error!(
                            "Task {} permanently failed after {} retries: {}",
                            task.task_id, task.retry_count, message
                        );
                        self.settle_failed(&task, message).await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Moves the task into the active path. Fails (returns false) when the
    /// task was cancelled or has otherwise left Pending/Queued, in which case
    /// the handler is never invoked. started_at is recorded on the first
    /// attempt only; the repository never rewrites it.
    async fn claim(&self, task: &BackgroundTask) -> Result<bool, QueueError> {
        self.persist(|| {
            self.repository.transition(
                &task.task_id,
                &CLAIMABLE,
                TaskPatch {
                    status: Some(TaskStatus::Processing),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
        })
        .await
    }

    async fn settle_completed(&self, task: &BackgroundTask, result: Value) -> Result<(), QueueError> {
        info!("Task {} completed successfully", task.task_id);
        self.persist(|| {
            self.repository.update(
                &task.task_id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    retry_count: Some(task.retry_count),
                    result: Some(result.clone()),
                    // a success after retries must not keep the stale error
                    error_message: Some(None),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
        })
        .await
    }

    async fn settle_failed(&self, task: &BackgroundTask, message: String) -> Result<(), QueueError> {
        self.persist(|| {
            self.repository.update(
                &task.task_id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    retry_count: Some(task.retry_count),
                    error_message: Some(Some(message.clone())),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
        })
        .await
    }

    async fn requeue_for_retry(&self, task: &BackgroundTask, message: String) -> Result<(), QueueError> {
        self.persist(|| {
            self.repository.update(
                &task.task_id,
                TaskPatch {
                    status: Some(TaskStatus::Queued),
                    retry_count: Some(task.retry_count),
                    error_message: Some(Some(message.clone())),
                    ..Default::default()
                },
            )
        })
        .await
    }

    /// Infrastructure-level retry around one repository call. Only
    /// `Persistence` errors are worth re-attempting; everything else is
    /// returned as-is.
    async fn persist<T, F, Fut>(&self, op: F) -> Result<T, QueueError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(QueueError::Persistence(msg)) => {
                    attempt += 1;
                    if attempt >= PERSIST_ATTEMPTS {
                        return Err(QueueError::Persistence(msg));
                    }
                    warn!(
                        "Persistence fault (attempt {}/{}): {}",
                        attempt, PERSIST_ATTEMPTS, msg
                    );
                    sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
