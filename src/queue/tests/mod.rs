use crate::queue::error::QueueError;
use crate::queue::executor::TaskExecutor;
use crate::queue::registry::HandlerRegistry;
use crate::queue::task_queue::TaskQueue;
use crate::queue::types::{BackgroundTask, TaskParameters, TaskSnapshot, TaskStatus, DEFAULT_MAX_RETRIES};
use crate::storage::task::{SqliteTaskRepository, TaskPatch, TaskRepository};
use crate::web::Pagination;

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Notify;
use tokio::time::sleep;

async fn setup_queue<F>(workers: usize, register: F) -> (Arc<TaskQueue>, NamedTempFile)
where
    F: FnOnce(&mut HandlerRegistry),
{
    // real exponential backoff, shrunk so retry chains finish quickly
    setup_queue_with_backoff(workers, Duration::from_millis(10), register).await
}

async fn setup_queue_with_backoff<F>(
    workers: usize,
    backoff_unit: Duration,
    register: F,
) -> (Arc<TaskQueue>, NamedTempFile)
where
    F: FnOnce(&mut HandlerRegistry),
{
    let temp_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}", temp_file.path().display());
    let repository: Arc<dyn TaskRepository> =
        Arc::new(SqliteTaskRepository::new(&url).await.unwrap());

    let mut registry = HandlerRegistry::new();
    register(&mut registry);
    let registry = Arc::new(registry);

    let executor = Arc::new(
        TaskExecutor::new(registry.clone(), repository.clone()).with_backoff_unit(backoff_unit),
    );

    let queue = Arc::new(TaskQueue::new(registry, repository, executor, workers));
    (queue, temp_file)
}

/// Repository wrapper that injects a bounded number of storage faults on
/// reads and writes. Everything else passes straight through to the real
/// store.
struct FaultyRepository {
    inner: Arc<dyn TaskRepository>,
    read_faults: AtomicU32,
    write_faults: AtomicU32,
}

impl FaultyRepository {
    fn new(inner: Arc<dyn TaskRepository>, read_faults: u32, write_faults: u32) -> Self {
        Self {
            inner,
            read_faults: AtomicU32::new(read_faults),
            write_faults: AtomicU32::new(write_faults),
        }
    }

    fn take_fault(budget: &AtomicU32) -> bool {
        budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl TaskRepository for FaultyRepository {
    async fn add(&self, task: &BackgroundTask) -> Result<String, QueueError> {
        self.inner.add(task).await
    }

    async fn get_by_id(&self, task_id: &str) -> Result<Option<BackgroundTask>, QueueError> {
        if Self::take_fault(&self.read_faults) {
            return Err(QueueError::Persistence("injected read fault".to_string()));
        }
        self.inner.get_by_id(task_id).await
    }

    async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<(), QueueError> {
        if Self::take_fault(&self.write_faults) {
            return Err(QueueError::Persistence("injected write fault".to_string()));
        }
        self.inner.update(task_id, patch).await
    }

    async fn transition(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        patch: TaskPatch,
    ) -> Result<bool, QueueError> {
        self.inner.transition(task_id, from, patch).await
    }

    async fn list(&self, pagination: &Pagination) -> Result<Vec<BackgroundTask>, QueueError> {
        self.inner.list(pagination).await
    }
}

async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> TaskSnapshot {
    for _ in 0..200 {
        if let Some(snapshot) = queue.get_status(task_id).await.unwrap() {
            if snapshot.status.is_terminal() {
                return snapshot;
            }
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("task {} never reached a terminal state", task_id);
}

fn params(entries: &[(&str, Value)]) -> TaskParameters {
    let mut map = TaskParameters::new();
    for (key, value) in entries {
        map.insert(key.to_string(), value.clone());
    }
    map
}

#[tokio::test]
async fn echo_task_completes_with_its_input() {
    let (queue, _db) = setup_queue(2, |registry| {
        registry.register_fn("echo", |parameters| async move {
            Ok(Value::Object(parameters))
        });
    })
    .await;

    let task_id = queue
        .enqueue("echo", params(&[("x", json!(5))]), None, DEFAULT_MAX_RETRIES)
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&queue, &task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.result, Some(json!({"x": 5})));
    assert_eq!(snapshot.retry_count, 0);
    assert!(snapshot.error.is_none());
    assert!(snapshot.started_at.is_some());
    assert!(snapshot.completed_at.is_some());
}

#[tokio::test]
async fn flaky_task_retries_then_completes() {
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();

    let (queue, _db) = setup_queue(1, move |registry| {
        registry.register_fn("flaky", move |parameters| {
            let calls = handler_calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient failure");
                }
                Ok(Value::Object(parameters))
            }
        });
    })
    .await;

    let task_id = queue
        .enqueue("flaky", TaskParameters::new(), None, 3)
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&queue, &task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Completed);
    assert_eq!(snapshot.retry_count, 2);
    // a success after failed attempts must not keep the stale error
    assert!(snapshot.error.is_none());
    assert!(snapshot.result.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failing_task_exhausts_retries_and_settles_failed() {
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();

    let (queue, _db) = setup_queue(1, move |registry| {
        registry.register_fn("always_fails", move |_| {
            let calls = handler_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("disk on fire")
            }
        });
    })
    .await;

    let task_id = queue
        .enqueue("always_fails", TaskParameters::new(), None, 2)
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&queue, &task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.retry_count, 2);
    assert!(snapshot.result.is_none());
    let error = snapshot.error.expect("failed task records its error");
    assert!(error.contains("disk on fire"));
    // initial attempt plus two retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unregistered_task_type_fails_without_retry() {
    let (queue, _db) = setup_queue(1, |_| {}).await;

    let task_id = queue
        .enqueue("unknown_type", TaskParameters::new(), None, 3)
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&queue, &task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.retry_count, 0);
    assert!(snapshot
        .error
        .unwrap()
        .contains("no handler registered for task type"));
}

#[tokio::test]
async fn cancel_before_pickup_prevents_execution() {
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicU32::new(0));
    let handler_gate = gate.clone();
    let handler_calls = calls.clone();

    let (queue, _db) = setup_queue(1, move |registry| {
        registry.register_fn("block", move |_| {
            let gate = handler_gate.clone();
            async move {
                gate.notified().await;
                Ok(Value::Null)
            }
        });
        registry.register_fn("counted", move |_| {
            let calls = handler_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    })
    .await;

    // occupy the single worker so the second task stays queued
    let blocker = queue
        .enqueue("block", TaskParameters::new(), None, 0)
        .await
        .unwrap();
    let victim = queue
        .enqueue("counted", TaskParameters::new(), None, 0)
        .await
        .unwrap();

    assert!(queue.cancel(&victim).await.unwrap());

    gate.notify_one();
    wait_for_terminal(&queue, &blocker).await;

    let snapshot = wait_for_terminal(&queue, &victim).await;
    assert_eq!(snapshot.status, TaskStatus::Cancelled);
    assert!(snapshot.completed_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must never run");

    // cancelling again is a no-op
    assert!(!queue.cancel(&victim).await.unwrap());
}

#[tokio::test]
async fn cancel_of_completed_task_is_a_no_op() {
    let (queue, _db) = setup_queue(1, |registry| {
        registry.register_fn("echo", |parameters| async move {
            Ok(Value::Object(parameters))
        });
    })
    .await;

    let task_id = queue
        .enqueue("echo", TaskParameters::new(), None, 0)
        .await
        .unwrap();
    let before = wait_for_terminal(&queue, &task_id).await;
    assert_eq!(before.status, TaskStatus::Completed);

    assert!(!queue.cancel(&task_id).await.unwrap());

    let after = queue.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(before, after, "failed cancel must not alter the record");
}

#[tokio::test]
async fn duplicate_task_id_is_rejected() {
    let (queue, _db) = setup_queue(1, |registry| {
        registry.register_fn("echo", |parameters| async move {
            Ok(Value::Object(parameters))
        });
    })
    .await;

    let task_id = queue
        .enqueue(
            "echo",
            params(&[("x", json!(1))]),
            Some("fixed-id".to_string()),
            0,
        )
        .await
        .unwrap();
    let original = wait_for_terminal(&queue, &task_id).await;

    let err = queue
        .enqueue(
            "echo",
            params(&[("x", json!(2))]),
            Some("fixed-id".to_string()),
            0,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        crate::queue::error::QueueError::DuplicateTask(_)
    ));

    let unchanged = queue.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(original, unchanged);
}

#[tokio::test]
async fn status_snapshot_is_idempotent() {
    let (queue, _db) = setup_queue(1, |registry| {
        registry.register_fn("echo", |parameters| async move {
            Ok(Value::Object(parameters))
        });
    })
    .await;

    let task_id = queue
        .enqueue("echo", TaskParameters::new(), None, 0)
        .await
        .unwrap();
    wait_for_terminal(&queue, &task_id).await;

    let first = queue.get_status(&task_id).await.unwrap().unwrap();
    let second = queue.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn status_of_unknown_task_is_none() {
    let (queue, _db) = setup_queue(1, |_| {}).await;
    assert!(queue.get_status("no-such-task").await.unwrap().is_none());
}

#[tokio::test]
async fn task_types_are_visible_through_the_queue() {
    let (queue, _db) = setup_queue(1, |registry| {
        registry.register_fn("transcription", |_| async { Ok(Value::Null) });
        registry.register_fn("diarization", |_| async { Ok(Value::Null) });
    })
    .await;

    assert_eq!(queue.list_task_types(), vec!["diarization", "transcription"]);
}

#[tokio::test]
async fn tasks_beyond_worker_capacity_run_in_arrival_order() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler_order = order.clone();

    let (queue, _db) = setup_queue(1, move |registry| {
        registry.register_fn("record", move |parameters| {
            let order = handler_order.clone();
            async move {
                let label = parameters["label"].as_str().unwrap_or("").to_string();
                order.lock().unwrap().push(label);
                Ok(Value::Null)
            }
        });
    })
    .await;

    let mut ids = Vec::new();
    for label in ["a", "b", "c"] {
        let id = queue
            .enqueue("record", params(&[("label", json!(label))]), None, 0)
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        wait_for_terminal(&queue, id).await;
    }

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn transient_storage_faults_do_not_consume_task_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();

    let temp_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}", temp_file.path().display());
    let storage: Arc<dyn TaskRepository> =
        Arc::new(SqliteTaskRepository::new(&url).await.unwrap());
    // two faults each on the initial read and on the settling write, below
    // the infrastructure retry ceiling
    let repository: Arc<dyn TaskRepository> =
        Arc::new(FaultyRepository::new(storage.clone(), 2, 2));

    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", move |parameters| {
        let calls = handler_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(parameters))
        }
    });
    let executor = TaskExecutor::new(Arc::new(registry), repository)
        .with_backoff_unit(Duration::from_millis(10));

    let task = BackgroundTask::new(
        "wobbly-storage".to_string(),
        "echo",
        TaskParameters::new(),
        3,
    );
    storage.add(&task).await.unwrap();

    executor.execute("wobbly-storage").await;

    let settled = storage.get_by_id("wobbly-storage").await.unwrap().unwrap();
    assert_eq!(settled.status, TaskStatus::Completed);
    // storage hiccups never count against the task's own retry budget
    assert_eq!(settled.retry_count, 0);
    assert!(settled.result.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unresolvable_storage_fault_leaves_last_persisted_state() {
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();

    let temp_file = NamedTempFile::new().unwrap();
    let url = format!("sqlite://{}", temp_file.path().display());
    let storage: Arc<dyn TaskRepository> =
        Arc::new(SqliteTaskRepository::new(&url).await.unwrap());
    let repository: Arc<dyn TaskRepository> =
        Arc::new(FaultyRepository::new(storage.clone(), 0, u32::MAX));

    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", move |parameters| {
        let calls = handler_calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(parameters))
        }
    });
    let executor = TaskExecutor::new(Arc::new(registry), repository)
        .with_backoff_unit(Duration::from_millis(10));

    let task = BackgroundTask::new(
        "doomed-storage".to_string(),
        "echo",
        TaskParameters::new(),
        3,
    );
    storage.add(&task).await.unwrap();

    executor.execute("doomed-storage").await;

    // the claim went through but the outcome could never be written; the
    // record keeps its last durable state for out-of-band reconciliation
    let stranded = storage.get_by_id("doomed-storage").await.unwrap().unwrap();
    assert_eq!(stranded.status, TaskStatus::Processing);
    assert!(stranded.result.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_during_backoff_window_wins_the_retry_race() {
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();

    // a wide backoff unit keeps the task parked in Queued long enough for
    // the cancel to land between attempts
    let (queue, _db) = setup_queue_with_backoff(1, Duration::from_millis(500), move |registry| {
        registry.register_fn("stubborn", move |_| {
            let calls = handler_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("still broken")
            }
        });
    })
    .await;

    let task_id = queue
        .enqueue("stubborn", TaskParameters::new(), None, 5)
        .await
        .unwrap();

    // wait for the first attempt to fail and the task to re-enter Queued
    let mut requeued = false;
    for _ in 0..200 {
        let snapshot = queue.get_status(&task_id).await.unwrap().unwrap();
        if snapshot.status == TaskStatus::Queued && snapshot.retry_count == 1 {
            requeued = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(requeued, "task never entered its backoff window");

    assert!(queue.cancel(&task_id).await.unwrap());

    let snapshot = wait_for_terminal(&queue, &task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Cancelled);

    // outlive the backoff: when the worker wakes it must find the task
    // unclaimable and walk away without another attempt
    sleep(Duration::from_millis(1300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no attempt after the cancel");
    let after = queue.get_status(&task_id).await.unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn shutdown_drains_queued_work_before_exiting() {
    let calls = Arc::new(AtomicU32::new(0));
    let handler_calls = calls.clone();

    let (queue, _db) = setup_queue(1, move |registry| {
        registry.register_fn("tick", move |_| {
            let calls = handler_calls.clone();
            async move {
                sleep(Duration::from_millis(20)).await;
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    })
    .await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = queue
            .enqueue("tick", TaskParameters::new(), None, 0)
            .await
            .unwrap();
        ids.push(id);
    }

    queue.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    for id in &ids {
        let snapshot = queue.get_status(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
    }

    // the pool is gone; a late enqueue persists its task but does not run it
    let late = queue
        .enqueue("tick", TaskParameters::new(), None, 0)
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    let snapshot = queue.get_status(&late).await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Queued);
}
