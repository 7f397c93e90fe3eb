//! Delivery guarantees of the invalidation queue.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{fast_queue_config, queue_drained, stats_for, wait_until};
use scriptorium::domain::types::TaskState;
use scriptorium::queue::{
    Delivery, Distributor, HandlerError, HandlerTable, MemoryQueueBackend, Processor,
    QueueBackend, QueueConfig, QueueError, Task, TaskHandler,
};
use serde_json::json;
use tokio::sync::Notify;

const SETTLE: Duration = Duration::from_secs(5);

/// Fails until `failures` attempts have been made, then succeeds.
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Flaky {
    async fn handle(&self, _task: &Delivery) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(HandlerError::failed(format!("transient failure {call}")))
        } else {
            Ok(())
        }
    }
}

/// Fails while `healthy` is false.
struct Switchable {
    healthy: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Switchable {
    async fn handle(&self, _task: &Delivery) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HandlerError::failed("downstream unavailable"))
        }
    }
}

fn table(task_type: &str, handler: Arc<dyn TaskHandler>) -> HandlerTable {
    let mut handlers = HandlerTable::new();
    handlers.register(task_type, handler);
    handlers
}

async fn dead_count(queue: &MemoryQueueBackend) -> usize {
    queue.list_dead(100).await.map_or(0, |dead| dead.len())
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let handler = Arc::new(Flaky {
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    let processor = Processor::new(queue.clone(), table("test:flaky", handler.clone()), config);

    distributor
        .enqueue(Task::new("test:flaky", json!({})), distributor.default_options())
        .await
        .unwrap();
    let handle = processor.start().unwrap();

    assert!(queue_drained(queue.as_ref(), SETTLE).await);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let task = &queue.snapshot()[0];
    assert_eq!(task.state, TaskState::Done);
    assert_eq!(task.attempts, 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn exhausted_task_moves_to_dead_set_and_can_be_requeued() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let handler = Arc::new(Switchable {
        healthy: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
    });
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    let processor = Processor::new(queue.clone(), table("test:switch", handler.clone()), config);

    let id = distributor
        .enqueue(
            Task::new("test:switch", json!({ "n": 1 })),
            distributor.default_options().with_max_retry(2),
        )
        .await
        .unwrap();
    let handle = processor.start().unwrap();

    let dead = {
        let queue = &queue;
        wait_until(SETTLE, move || async move { dead_count(queue).await == 1 }).await
    };
    assert!(dead);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let listed = queue.list_dead(10).await.unwrap();
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].attempts, 3);
    assert_eq!(
        listed[0].last_error.as_deref(),
        Some("downstream unavailable")
    );

    handler.healthy.store(true, Ordering::SeqCst);
    assert_eq!(queue.requeue_dead(Some(&id)).await.unwrap(), 1);
    let done = {
        let queue = &queue;
        wait_until(SETTLE, move || async move {
            stats_for(queue.as_ref(), "critical").await.done == 1
        })
        .await
    };
    assert!(done);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

    handle.shutdown().await;
}

/// Never finishes on its own; signals once it has started.
struct Hang {
    started: Notify,
}

#[async_trait]
impl TaskHandler for Hang {
    async fn handle(&self, _task: &Delivery) -> Result<(), HandlerError> {
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn attempt_exceeding_its_timeout_counts_as_failure() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let hang = Arc::new(Hang {
        started: Notify::new(),
    });
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    let processor = Processor::new(queue.clone(), table("test:hang", hang), config);

    distributor
        .enqueue(
            Task::new("test:hang", json!({})),
            distributor
                .default_options()
                .with_max_retry(0)
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    let handle = processor.start().unwrap();

    let dead = {
        let queue = &queue;
        wait_until(SETTLE, move || async move { dead_count(queue).await == 1 }).await
    };
    assert!(dead);
    let task = &queue.list_dead(1).await.unwrap()[0];
    assert!(task.last_error.as_deref().unwrap_or_default().contains("timed out"));

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_abandons_attempts_that_outlive_the_timeout() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let hang = Arc::new(Hang {
        started: Notify::new(),
    });
    let config = QueueConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..fast_queue_config()
    };
    let distributor = Distributor::new(queue.clone(), config.clone());
    distributor
        .enqueue(
            Task::new("test:hang", json!({})),
            distributor
                .default_options()
                .with_timeout(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    let handle = Processor::new(queue.clone(), table("test:hang", hang.clone()), config)
        .start()
        .unwrap();
    hang.started.notified().await;
    let report = handle.shutdown().await;

    assert_eq!(report.abandoned, 1);
    assert_eq!(report.drained, 0);
}

/// Tracks attempts per queue: start order and the peak running at once.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    running: Mutex<std::collections::HashMap<String, (usize, usize)>>,
}

impl Recorder {
    fn peak(&self, queue: &str) -> usize {
        self.running
            .lock()
            .expect("recorder lock")
            .get(queue)
            .map_or(0, |(_, peak)| *peak)
    }
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn handle(&self, task: &Delivery) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .expect("recorder lock")
            .push(task.queue.clone());
        {
            let mut running = self.running.lock().expect("recorder lock");
            let entry = running.entry(task.queue.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(entry) = self
            .running
            .lock()
            .expect("recorder lock")
            .get_mut(&task.queue)
        {
            entry.0 -= 1;
        }
        Ok(())
    }
}

#[tokio::test]
async fn weighted_queues_get_proportional_workers_without_starvation() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let recorder = Arc::new(Recorder::default());
    let config = QueueConfig {
        weights: vec![("critical".to_string(), 3), ("default".to_string(), 1)],
        concurrency: 4,
        ..fast_queue_config()
    };
    let distributor = Distributor::new(queue.clone(), config.clone());
    for n in 0..6 {
        for name in ["critical", "default"] {
            distributor
                .enqueue(
                    Task::new("test:record", json!({ "n": n })),
                    distributor.default_options().with_queue(name),
                )
                .await
                .unwrap();
        }
    }

    let handle = Processor::new(queue.clone(), table("test:record", recorder.clone()), config)
        .start()
        .unwrap();
    assert!(queue_drained(queue.as_ref(), SETTLE).await);
    handle.shutdown().await;

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 12);
    assert!(seen[..4].iter().any(|queue| queue == "default"));
    assert!(recorder.peak("critical") <= 3);
    assert_eq!(recorder.peak("default"), 1);
}

/// Tracks the highest number of attempts running at once.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Gauge {
    async fn handle(&self, _task: &Delivery) -> Result<(), HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn concurrency_limit_bounds_in_flight_attempts() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let gauge = Arc::new(Gauge::default());
    let config = QueueConfig {
        weights: vec![("critical".to_string(), 1)],
        concurrency: 2,
        ..fast_queue_config()
    };
    let distributor = Distributor::new(queue.clone(), config.clone());
    for n in 0..6 {
        distributor
            .enqueue(
                Task::new("test:gauge", json!({ "n": n })),
                distributor.default_options(),
            )
            .await
            .unwrap();
    }

    let handle = Processor::new(queue.clone(), table("test:gauge", gauge.clone()), config)
        .start()
        .unwrap();
    assert!(queue_drained(queue.as_ref(), SETTLE).await);
    handle.shutdown().await;

    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_attempts() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let gauge = Arc::new(Gauge::default());
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    distributor
        .enqueue(Task::new("test:gauge", json!({})), distributor.default_options())
        .await
        .unwrap();

    let handle = Processor::new(queue.clone(), table("test:gauge", gauge.clone()), config)
        .start()
        .unwrap();
    let started = {
        let gauge = &gauge;
        wait_until(SETTLE, move || async move {
            gauge.current.load(Ordering::SeqCst) > 0
        })
        .await
    };
    assert!(started);

    let report = handle.shutdown().await;
    assert_eq!(report.drained, 1);
    assert_eq!(report.abandoned, 0);
    assert_eq!(stats_for(queue.as_ref(), "critical").await.done, 1);
}

#[tokio::test]
async fn unregistered_task_type_is_buried_without_spending_its_retries() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    distributor
        .enqueue(
            Task::new("test:unknown", json!({})),
            distributor.default_options().with_max_retry(3),
        )
        .await
        .unwrap();

    let handle = Processor::new(queue.clone(), HandlerTable::new(), config)
        .start()
        .unwrap();
    let dead = {
        let queue = &queue;
        wait_until(SETTLE, move || async move { dead_count(queue).await == 1 }).await
    };
    assert!(dead);
    assert_eq!(queue.list_dead(1).await.unwrap()[0].attempts, 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn processor_cannot_start_twice() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let processor = Processor::new(queue, HandlerTable::new(), fast_queue_config());

    let handle = processor.start().unwrap();
    assert!(matches!(processor.start(), Err(QueueError::AlreadyStarted)));
    handle.shutdown().await;
}

#[tokio::test]
async fn delayed_task_waits_for_its_start_time() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let gauge = Arc::new(Gauge::default());
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    distributor
        .enqueue(
            Task::new("test:gauge", json!({})),
            distributor
                .default_options()
                .with_process_in(Duration::from_millis(300)),
        )
        .await
        .unwrap();
    assert_eq!(stats_for(queue.as_ref(), "critical").await.scheduled, 1);

    let handle = Processor::new(queue.clone(), table("test:gauge", gauge.clone()), config)
        .start()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 0);

    assert!(queue_drained(queue.as_ref(), SETTLE).await);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn out_of_range_task_is_rejected_and_later_tasks_still_run() {
    let queue = Arc::new(MemoryQueueBackend::new());
    let gauge = Arc::new(Gauge::default());
    let config = fast_queue_config();
    let distributor = Distributor::new(queue.clone(), config.clone());
    let handle = Processor::new(queue.clone(), table("test:gauge", gauge.clone()), config)
        .start()
        .unwrap();

    let err = distributor
        .enqueue(
            Task::new("test:gauge", json!({})),
            distributor
                .default_options()
                .with_process_in(Duration::MAX),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidTask(_)));

    distributor
        .enqueue(Task::new("test:gauge", json!({})), distributor.default_options())
        .await
        .unwrap();
    assert!(queue_drained(queue.as_ref(), SETTLE).await);
    assert_eq!(stats_for(queue.as_ref(), "critical").await.done, 1);

    handle.shutdown().await;
}
