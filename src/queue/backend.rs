//! Storage seam for the invalidation queue.
//!
//! Engines persist tasks and attach apalis workers for their queues; the
//! apalis runtime owns reservation, concurrency and graceful shutdown.

use std::time::Duration;

use apalis::prelude::Monitor;
use async_trait::async_trait;
use thiserror::Error;

use super::config::RetryBackoff;
use super::processor::WorkerContext;
use super::task::{NewTask, QueueStats, QueuedTask, TaskRecord};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend `{backend}` failed during {op}: {message}")]
    Backend {
        backend: &'static str,
        op: &'static str,
        message: String,
    },
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),
    #[error("enqueue cancelled: caller deadline exceeded")]
    Cancelled,
    #[error("enqueue timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("processor already started")]
    AlreadyStarted,
}

impl QueueError {
    pub fn backend(backend: &'static str, op: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            backend,
            op,
            message: message.to_string(),
        }
    }
}

/// One apalis worker to attach for a named queue.
#[derive(Clone)]
pub struct WorkerSpec {
    /// Worker identity; reservations are locked to it.
    pub name: String,
    pub queue: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Silence after which a worker's reservations are handed to others.
    pub orphan_after: Duration,
    pub context: WorkerContext,
}

/// A failed attempt reported back to the engine that delivered it.
#[derive(Debug, Clone)]
pub struct AttemptFailure<'a> {
    pub id: &'a str,
    /// Worker that holds the reservation.
    pub worker: &'a str,
    pub queue: &'a str,
    pub task: &'a QueuedTask,
    pub error: &'a str,
    /// No further attempt can succeed, whatever the budget says.
    pub permanent: bool,
    pub backoff: RetryBackoff,
}

/// How the engine booked a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Another delivery follows after `delay`.
    Retry { attempt: i32, delay: Duration },
    /// The budget is spent; the task rests in the dead set.
    Dead { attempt: i32 },
    /// The reservation is no longer held by the reporting worker.
    Lost,
}

/// Persistence for queued tasks.
///
/// Delivery is at-least-once: a task whose worker stops heartbeating is handed
/// to another worker, so handlers must tolerate running twice.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Persist a task and return its id.
    async fn push(&self, task: NewTask) -> Result<String, QueueError>;

    /// Attach a worker consuming `spec.queue` to `monitor`.
    fn register(&self, monitor: Monitor, spec: WorkerSpec) -> Monitor;

    /// Record that `worker` began a delivery of task `id`.
    ///
    /// Engines whose runtime tracks delivery state itself keep the default.
    async fn mark_running(&self, _id: &str, _worker: &str) -> Result<(), QueueError> {
        Ok(())
    }

    /// Record that task `id` completed.
    async fn mark_done(&self, _id: &str) -> Result<(), QueueError> {
        Ok(())
    }

    /// Decide between another delivery and the dead set for a failed attempt.
    ///
    /// Only the worker holding the reservation may book it; anyone else gets
    /// [`Disposition::Lost`] and the task is left untouched.
    async fn settle_failure(&self, failure: &AttemptFailure<'_>) -> Result<Disposition, QueueError>;

    /// Dead tasks, most recently failed first.
    async fn list_dead(&self, limit: u32) -> Result<Vec<TaskRecord>, QueueError>;

    /// Make dead tasks deliverable again with a fresh attempt budget.
    ///
    /// `None` requeues every dead task. Returns the number requeued.
    async fn requeue_dead(&self, id: Option<&str>) -> Result<u64, QueueError>;

    async fn stats(&self) -> Result<Vec<QueueStats>, QueueError>;

    /// Forget completed tasks, returning how many were removed.
    async fn purge_done(&self) -> Result<u64, QueueError>;
}
