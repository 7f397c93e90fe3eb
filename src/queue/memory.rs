//! Process-local queue engine on apalis' in-memory storage.
//!
//! Every named queue is a [`MemoryStorage`] channel consumed by its own apalis
//! worker. Task state is tracked alongside the channels so stats and the dead
//! set look the same as with Postgres. Nothing survives process exit; used by
//! tests and single-node development setups.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use apalis::layers::WorkerBuilderExt;
use apalis::prelude::{MemoryStorage, MessageQueue, Monitor, WorkerBuilder, WorkerFactoryFn};
use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::domain::types::TaskState;
use crate::util::lock::mutex_lock;

use super::backend::{AttemptFailure, Disposition, QueueBackend, QueueError, WorkerSpec};
use super::processor::process_task;
use super::task::{NewTask, QueueStats, QueuedTask, TaskRecord};

const BACKEND: &str = "memory";
const SOURCE: &str = "queue::memory";

#[derive(Default)]
pub struct MemoryQueueBackend {
    queues: Mutex<HashMap<String, MemoryStorage<QueuedTask>>>,
    tasks: Mutex<HashMap<String, TaskRecord>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every tracked task, for inspection in tests and tooling.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let tasks = mutex_lock(&self.tasks, SOURCE, "snapshot");
        let mut records: Vec<TaskRecord> = tasks.values().cloned().collect();
        records.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    fn storage(&self, queue: &str) -> MemoryStorage<QueuedTask> {
        mutex_lock(&self.queues, SOURCE, "storage")
            .entry(queue.to_string())
            .or_insert_with(MemoryStorage::new)
            .clone()
    }

    /// Hand `body` to the queue's channel once `delay` has passed.
    ///
    /// The send runs in the background so a queue nobody consumes yet never
    /// blocks the caller.
    fn deliver(&self, queue: &str, body: QueuedTask, delay: Duration) {
        let mut storage = self.storage(queue);
        let queue = queue.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if storage.enqueue(body).await.is_err() {
                warn!(target = SOURCE, queue = %queue, "in-memory queue closed; task dropped");
            }
        });
    }
}

fn after(now: OffsetDateTime, delay: Duration) -> OffsetDateTime {
    time::Duration::try_from(delay)
        .ok()
        .and_then(|delay| now.checked_add(delay))
        .unwrap_or(now)
}

fn not_found(op: &'static str, id: &str) -> QueueError {
    QueueError::backend(BACKEND, op, format!("task `{id}` not found"))
}

fn body_of(record: &TaskRecord) -> QueuedTask {
    QueuedTask {
        id: Some(record.id.clone()),
        task_type: record.task_type.clone(),
        payload: record.payload.clone(),
        timeout_ms: u64::try_from(record.timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn push(&self, task: NewTask) -> Result<String, QueueError> {
        let run_at = task.run_at(OffsetDateTime::now_utc())?;
        let NewTask {
            mut body,
            queue,
            max_attempts,
            process_in,
        } = task;

        let id = Uuid::new_v4().to_string();
        body.id = Some(id.clone());
        let record = TaskRecord {
            id: id.clone(),
            task_type: body.task_type.clone(),
            payload: body.payload.clone(),
            queue: queue.clone(),
            state: if process_in.is_zero() {
                TaskState::Pending
            } else {
                TaskState::Scheduled
            },
            attempts: 0,
            max_attempts,
            timeout: body.timeout(),
            run_at,
            locked_by: None,
            last_error: None,
            done_at: None,
        };
        mutex_lock(&self.tasks, SOURCE, "push").insert(id.clone(), record);
        self.deliver(&queue, body, process_in);
        Ok(id)
    }

    fn register(&self, monitor: Monitor, spec: WorkerSpec) -> Monitor {
        let worker = WorkerBuilder::new(spec.name)
            .concurrency(spec.concurrency)
            .data(spec.context)
            .backend(self.storage(&spec.queue))
            .build_fn(process_task);
        monitor.register(worker)
    }

    async fn mark_running(&self, id: &str, worker: &str) -> Result<(), QueueError> {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "mark_running");
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| not_found("mark_running", id))?;
        record.state = TaskState::Running;
        record.attempts = record.attempts.saturating_add(1);
        record.locked_by = Some(worker.to_string());
        Ok(())
    }

    async fn mark_done(&self, id: &str) -> Result<(), QueueError> {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "mark_done");
        let record = tasks.get_mut(id).ok_or_else(|| not_found("mark_done", id))?;
        record.state = TaskState::Done;
        record.locked_by = None;
        record.done_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn settle_failure(&self, failure: &AttemptFailure<'_>) -> Result<Disposition, QueueError> {
        let now = OffsetDateTime::now_utc();
        let (body, delay, disposition) = {
            let mut tasks = mutex_lock(&self.tasks, SOURCE, "settle_failure");
            let Some(record) = tasks.get_mut(failure.id).filter(|record| {
                record.state == TaskState::Running
                    && record.locked_by.as_deref() == Some(failure.worker)
            }) else {
                return Ok(Disposition::Lost);
            };

            let attempt = record.attempts;
            record.locked_by = None;
            record.last_error = Some(failure.error.to_string());
            if failure.permanent || attempt >= record.max_attempts {
                record.state = TaskState::Dead;
                record.done_at = Some(now);
                return Ok(Disposition::Dead { attempt });
            }

            let delay = failure.backoff.delay(attempt);
            record.state = TaskState::Retrying;
            record.run_at = after(now, delay);
            (
                body_of(record),
                delay,
                Disposition::Retry { attempt, delay },
            )
        };

        self.deliver(failure.queue, body, delay);
        Ok(disposition)
    }

    async fn list_dead(&self, limit: u32) -> Result<Vec<TaskRecord>, QueueError> {
        let tasks = mutex_lock(&self.tasks, SOURCE, "list_dead");
        let mut dead: Vec<TaskRecord> = tasks
            .values()
            .filter(|record| record.state == TaskState::Dead)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.done_at.cmp(&a.done_at));
        dead.truncate(limit as usize);
        Ok(dead)
    }

    async fn requeue_dead(&self, id: Option<&str>) -> Result<u64, QueueError> {
        let now = OffsetDateTime::now_utc();
        let requeued: Vec<(String, QueuedTask)> = {
            let mut tasks = mutex_lock(&self.tasks, SOURCE, "requeue_dead");
            tasks
                .values_mut()
                .filter(|record| {
                    record.state == TaskState::Dead && id.is_none_or(|id| id == record.id)
                })
                .map(|record| {
                    record.state = TaskState::Pending;
                    record.attempts = 0;
                    record.run_at = now;
                    record.done_at = None;
                    (record.queue.clone(), body_of(record))
                })
                .collect()
        };

        let count = requeued.len() as u64;
        for (queue, body) in requeued {
            self.deliver(&queue, body, Duration::ZERO);
        }
        Ok(count)
    }

    async fn stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let now = OffsetDateTime::now_utc();
        let tasks = mutex_lock(&self.tasks, SOURCE, "stats");
        let mut by_queue: HashMap<&str, QueueStats> = HashMap::new();
        for record in tasks.values() {
            let state = match record.state {
                TaskState::Pending | TaskState::Scheduled if record.run_at > now => {
                    TaskState::Scheduled
                }
                TaskState::Scheduled => TaskState::Pending,
                other => other,
            };
            by_queue
                .entry(record.queue.as_str())
                .or_insert_with(|| QueueStats::new(record.queue.clone()))
                .record(state, 1);
        }
        let mut stats: Vec<QueueStats> = by_queue.into_values().collect();
        stats.sort_by(|a, b| a.queue.cmp(&b.queue));
        Ok(stats)
    }

    async fn purge_done(&self) -> Result<u64, QueueError> {
        let mut tasks = mutex_lock(&self.tasks, SOURCE, "purge_done");
        let before = tasks.len();
        tasks.retain(|_, record| record.state != TaskState::Done);
        Ok((before - tasks.len()) as u64)
    }
}
