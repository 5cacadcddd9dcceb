use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::queue::executor::TaskExecutor;

/// One member of the worker pool. Workers drain a shared channel of task ids
/// in arrival order; whichever worker is free takes the next id. A worker is
/// occupied for the whole of a task's attempts, including its backoff
/// sleeps.
pub(crate) struct Worker {
    id: usize,
    executor: Arc<TaskExecutor>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl Worker {
    pub(crate) fn spawn(
        id: usize,
        executor: Arc<TaskExecutor>,
        receiver: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    ) -> JoinHandle<()> {
        let worker = Self {
            id,
            executor,
            receiver,
        };
        tokio::spawn(worker.run())
    }

    async fn run(self) {
        loop {
            // the lock is held only while waiting for the next id, so exactly
            // one idle worker contends for the channel at a time
            let next = { self.receiver.lock().await.recv().await };
            match next {
                Some(task_id) => {
                    debug!("Worker {} picked up task {}", self.id, task_id);
                    self.executor.execute(&task_id).await;
                }
                None => {
                    info!("Worker {} shutting down, queue closed", self.id);
                    break;
                }
            }
        }
    }
}
