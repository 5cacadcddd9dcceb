use std::fmt::Display;

/// Errors raised by the queue core.
///
/// Handler failures never escape as errors to callers of `enqueue`; they end
/// up as `error_message` on the task record. Only `DuplicateTask` (and
/// infrastructure failures of the initial insert) surface synchronously.
#[derive(Debug)]
pub enum QueueError {
    /// No handler registered for the task type. Terminal, never retried.
    HandlerNotFound(String),
    /// The handler returned an error. Retryable up to max_retries.
    HandlerExecution(String),
    /// Caller supplied a task_id that is already in use.
    DuplicateTask(String),
    /// The referenced task row does not exist.
    TaskNotFound(String),
    /// The backing store could not complete a read or write.
    Persistence(String),
}

impl Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::HandlerNotFound(task_type) => {
                write!(f, "no handler registered for task type: {}", task_type)
            }
            QueueError::HandlerExecution(msg) => write!(f, "handler execution failed: {}", msg),
            QueueError::DuplicateTask(task_id) => write!(f, "task already exists: {}", task_id),
            QueueError::TaskNotFound(task_id) => write!(f, "task not found: {}", task_id),
            QueueError::Persistence(msg) => write!(f, "persistence failure: {}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        QueueError::Persistence(error.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        QueueError::Persistence(format!("corrupt task record: {}", error))
    }
}
