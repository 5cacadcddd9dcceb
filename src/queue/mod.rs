use std::sync::Arc;

pub mod error;
pub mod executor;
pub mod handlers;
pub mod registry;
pub mod task_queue;
pub mod types;
mod worker;

pub use error::QueueError;
pub use executor::TaskExecutor;
pub use registry::{HandlerRegistry, TaskHandler};
pub use task_queue::TaskQueue;
pub use types::{
    BackgroundTask, TaskParameters, TaskSnapshot, TaskStatus, DEFAULT_MAX_RETRIES,
};

use crate::storage::task::TaskRepository;

/// Wires registry, executor and worker pool together. The registry must be
/// fully populated before this is called; workers start immediately.
pub fn create_task_queue(
    registry: HandlerRegistry,
    repository: Arc<dyn TaskRepository>,
    worker_count: usize,
) -> Arc<TaskQueue> {
    let registry = Arc::new(registry);
    let executor = Arc::new(TaskExecutor::new(registry.clone(), repository.clone()));
    Arc::new(TaskQueue::new(registry, repository, executor, worker_count))
}

#[cfg(test)]
mod tests;
