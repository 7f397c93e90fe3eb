//! Producer side of the invalidation queue.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::keys::CacheKey;
use crate::tx::{Effect, EffectSink};

use super::backend::{QueueBackend, QueueError};
use super::config::QueueConfig;
use super::task::{EnqueueOptions, NewTask, Task};

const SOURCE: &str = "queue::distributor";

/// Persists tasks for later processing.
///
/// A successful enqueue means the task is durably stored; it says nothing
/// about when or whether the task has run.
#[derive(Clone)]
pub struct Distributor {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
}

impl Distributor {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    /// Options of the default invalidation policy.
    pub fn default_options(&self) -> EnqueueOptions {
        self.config.policy.options()
    }

    pub async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<String, QueueError> {
        let now = Instant::now();
        if options.deadline.is_some_and(|deadline| deadline <= now) {
            return Err(QueueError::Cancelled);
        }
        if !self.config.knows_queue(&options.queue) {
            return Err(QueueError::UnknownQueue(options.queue));
        }
        let new_task = NewTask::new(task, &options)?;

        let remaining = options.deadline.map(|deadline| deadline - now);
        let budget = remaining.map_or(self.config.enqueue_timeout, |left| {
            left.min(self.config.enqueue_timeout)
        });
        let deadline_binds = remaining.is_some_and(|left| left <= self.config.enqueue_timeout);

        let queue = new_task.queue.clone();
        let task_type = new_task.body.task_type.clone();

        let result = match tokio::time::timeout(budget, self.backend.push(new_task)).await {
            Ok(result) => result,
            Err(_) if deadline_binds => Err(QueueError::Cancelled),
            Err(_) => Err(QueueError::Timeout(budget)),
        };

        match &result {
            Ok(id) => {
                counter!("scriptorium_queue_enqueued_total", "queue" => queue.clone()).increment(1);
                debug!(
                    target = SOURCE,
                    task_id = %id,
                    task_type = %task_type,
                    queue = %queue,
                    "task enqueued"
                );
            }
            Err(err) => {
                counter!("scriptorium_queue_enqueue_failed_total", "queue" => queue.clone())
                    .increment(1);
                warn!(
                    target = SOURCE,
                    task_type = %task_type,
                    queue = %queue,
                    error = %err,
                    "failed to enqueue task"
                );
            }
        }

        result
    }

    /// Enqueue deletion of `keys` under the default policy.
    ///
    /// Returns `Ok(None)` without touching the backend when `keys` is empty.
    pub async fn enqueue_invalidation(&self, keys: &[CacheKey]) -> Result<Option<String>, QueueError> {
        if keys.is_empty() {
            return Ok(None);
        }
        self.enqueue(Task::delete_cache_keys(keys), self.default_options())
            .await
            .map(Some)
    }
}

#[async_trait]
impl EffectSink for Distributor {
    async fn dispatch(&self, effect: &Effect) -> Result<(), QueueError> {
        match effect {
            Effect::InvalidateKeys { keys } => self.enqueue_invalidation(keys).await.map(|_| ()),
        }
    }
}
