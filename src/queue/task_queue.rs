use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::error::QueueError;
use crate::queue::executor::TaskExecutor;
use crate::queue::registry::HandlerRegistry;
use crate::queue::types::{BackgroundTask, TaskParameters, TaskSnapshot, TaskStatus};
use crate::queue::worker::Worker;
use crate::storage::task::{TaskPatch, TaskRepository};
use crate::web::Pagination;

/// Public entry point for background work. Enqueues tasks, answers status
/// queries and cancels not-yet-started work.
///
/// Execution runs on a fixed-size in-process worker pool fed by a FIFO
/// channel; callers only depend on the enqueue/get_status/cancel contract, so
/// a distributed backend can replace the pool without touching calling code.
pub struct TaskQueue {
    registry: Arc<HandlerRegistry>,
    repository: Arc<dyn TaskRepository>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        repository: Arc<dyn TaskRepository>,
        executor: Arc<TaskExecutor>,
        worker_count: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count.max(1))
            .map(|id| Worker::spawn(id, executor.clone(), receiver.clone()))
            .collect();

        info!("Task queue started with {} workers", worker_count.max(1));

        Self {
            registry,
            repository,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Persists a new task and schedules it for asynchronous execution,
    /// returning its id immediately. The handler outcome is observed by
    /// polling `get_status`, never as an error from this call.
    pub async fn enqueue(
        &self,
        task_type: &str,
        parameters: TaskParameters,
        task_id: Option<String>,
        max_retries: u32,
    ) -> Result<String, QueueError> {
        let task_id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let task = BackgroundTask::new(task_id, task_type, parameters, max_retries);

        self.repository.add(&task).await?;

        // hand off to the pool; the executor claims from Pending as well, so
        // a failed Queued hop cannot strand the task
        let queued = self
            .repository
            .transition(
                &task.task_id,
                &[TaskStatus::Pending],
                TaskPatch {
                    status: Some(TaskStatus::Queued),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = queued {
            warn!("Task {} stays pending, queued hop failed: {}", task.task_id, e);
        }

        let delivered = match self.sender.lock().await.as_ref() {
            Some(sender) => sender.send(task.task_id.clone()).is_ok(),
            None => false,
        };
        if !delivered {
            warn!(
                "Worker pool is stopped; task {} remains queued",
                task.task_id
            );
        }

        info!("Enqueued task {} of type {}", task.task_id, task_type);
        Ok(task.task_id)
    }

    /// Read-only snapshot; never triggers execution.
    pub async fn get_status(&self, task_id: &str) -> Result<Option<TaskSnapshot>, QueueError> {
        let task = self.repository.get_by_id(task_id).await?;
        Ok(task.map(|t| t.snapshot()))
    }

    /// Marks a Pending or Queued task as cancelled. Returns false for tasks
    /// already running or settled: cancellation only promises "will not
    /// start", never interruption of work in progress.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, QueueError> {
        let cancelled = self
            .repository
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Queued],
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        if cancelled {
            info!("Task {} cancelled", task_id);
        } else {
            info!("Cancel of task {} was a no-op", task_id);
        }
        Ok(cancelled)
    }

    pub async fn list(&self, pagination: &Pagination) -> Result<Vec<TaskSnapshot>, QueueError> {
        let tasks = self.repository.list(pagination).await?;
        Ok(tasks.iter().map(BackgroundTask::snapshot).collect())
    }

    /// Registered task types, for health-style introspection.
    pub fn list_task_types(&self) -> Vec<String> {
        self.registry.list_task_types()
    }

    /// Closes the intake channel and waits for queued and in-flight work to
    /// finish. Further enqueues persist their task but are not executed.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
    }
}
