use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::queue::types::TaskParameters;

/// The work behind one task_type.
///
/// Handlers must be idempotent-safe: a retried attempt re-runs the handler
/// from scratch, there is no partial-result resumption.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, parameters: &TaskParameters) -> anyhow::Result<Value>;
}

/// Maps task_type strings to handlers.
///
/// Registration happens once at startup, before any worker runs; afterwards
/// the registry is shared behind an `Arc` and read without locking. Handler
/// absence on lookup is a normal outcome, not an error — the executor turns
/// it into a terminal task failure.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a handler to a task type. Re-registering overwrites the previous
    /// binding (last write wins), which is what lets tests substitute
    /// handlers.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            warn!("Replacing handler for task type: {}", task_type);
        } else {
            info!("Registered handler for task type: {}", task_type);
        }
    }

    /// Convenience for registering a plain async closure.
    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(TaskParameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler(handler)));
    }

    pub fn get_handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn is_registered(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted for stable introspection output.
    pub fn list_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskParameters) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, parameters: &TaskParameters) -> anyhow::Result<Value> {
        (self.0)(parameters.clone()).await
    }
}
