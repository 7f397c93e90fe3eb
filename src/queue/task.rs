//! Task model shared by the distributor, engines and processor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::domain::keys::CacheKey;
use crate::domain::types::TaskState;

use super::backend::QueueError;

/// Task type that deletes a batch of cache keys.
pub const TASK_DELETE_CACHE_KEYS: &str = "cache:delete_keys";

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

/// Longest budget a single attempt may be given.
pub const MAX_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Furthest into the future a task may be scheduled.
pub const MAX_PROCESS_IN: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Largest retry budget a task may carry.
pub const MAX_RETRY: u32 = 100;

/// Payload of [`TASK_DELETE_CACHE_KEYS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteCacheKeysPayload {
    pub keys: Vec<String>,
}

/// Unit of work submitted to the queue: a type tag plus a JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    task_type: String,
    payload: serde_json::Value,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
        }
    }

    pub fn delete_cache_keys(keys: &[CacheKey]) -> Self {
        let keys: Vec<String> = keys.iter().map(CacheKey::render).collect();
        Self::new(
            TASK_DELETE_CACHE_KEYS,
            serde_json::json!({ "keys": keys }),
        )
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// Per-enqueue delivery options.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    /// Retries after the first delivery; total deliveries are `max_retry + 1`.
    pub max_retry: u32,
    /// Budget for a single processing attempt.
    pub timeout: Duration,
    /// Delay before the task becomes eligible.
    pub process_in: Duration,
    pub queue: String,
    /// Caller deadline for the enqueue itself.
    pub deadline: Option<Instant>,
}

impl EnqueueOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject values the engines cannot represent.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.timeout.is_zero() {
            return Err(QueueError::InvalidTask(
                "task timeout must be greater than zero".to_string(),
            ));
        }
        if self.timeout > MAX_TASK_TIMEOUT {
            return Err(QueueError::InvalidTask(format!(
                "task timeout {:?} exceeds {:?}",
                self.timeout, MAX_TASK_TIMEOUT
            )));
        }
        if self.process_in > MAX_PROCESS_IN {
            return Err(QueueError::InvalidTask(format!(
                "start delay {:?} exceeds {:?}",
                self.process_in, MAX_PROCESS_IN
            )));
        }
        if self.max_retry > MAX_RETRY {
            return Err(QueueError::InvalidTask(format!(
                "max_retry {} exceeds {MAX_RETRY}",
                self.max_retry
            )));
        }
        Ok(())
    }
}

/// Job body stored by the queue engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Receipt handed out by engines that cannot report their own job id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub timeout_ms: u64,
}

impl QueuedTask {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A validated task ready to be persisted by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub body: QueuedTask,
    pub queue: String,
    /// Deliveries the task may receive in total.
    pub max_attempts: i32,
    pub process_in: Duration,
}

impl NewTask {
    pub fn new(task: Task, options: &EnqueueOptions) -> Result<Self, QueueError> {
        options.validate()?;
        let timeout_ms = u64::try_from(options.timeout.as_millis()).map_err(|_| {
            QueueError::InvalidTask(format!("task timeout {:?} out of range", options.timeout))
        })?;

        let max_attempts = i32::try_from(options.max_retry.saturating_add(1)).map_err(|_| {
            QueueError::InvalidTask(format!("max_retry {} out of range", options.max_retry))
        })?;

        Ok(Self {
            body: QueuedTask {
                id: None,
                task_type: task.task_type,
                payload: task.payload,
                timeout_ms,
            },
            queue: options.queue.clone(),
            max_attempts,
            process_in: options.process_in,
        })
    }

    /// Wall-clock time the task becomes eligible.
    pub fn run_at(&self, now: OffsetDateTime) -> Result<OffsetDateTime, QueueError> {
        now.checked_add(time::Duration::try_from(self.process_in).map_err(|_| {
            QueueError::InvalidTask(format!("start delay {:?} out of range", self.process_in))
        })?)
        .ok_or_else(|| {
            QueueError::InvalidTask(format!("start delay {:?} out of range", self.process_in))
        })
    }
}

/// A task delivered to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub queue: String,
    pub task_type: String,
    pub payload: serde_json::Value,
}

/// Persisted task as seen by operators.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub state: TaskState,
    /// Deliveries made so far.
    pub attempts: i32,
    pub max_attempts: i32,
    pub timeout: Duration,
    pub run_at: OffsetDateTime,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub done_at: Option<OffsetDateTime>,
}

/// Per-queue task counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: u64,
    pub scheduled: u64,
    pub running: u64,
    pub retrying: u64,
    pub dead: u64,
    pub done: u64,
}

impl QueueStats {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, state: TaskState, count: u64) {
        match state {
            TaskState::Pending => self.pending += count,
            TaskState::Scheduled => self.scheduled += count,
            TaskState::Running => self.running += count,
            TaskState::Retrying => self.retrying += count,
            TaskState::Dead => self.dead += count,
            TaskState::Done => self.done += count,
        }
    }

    /// Tasks that still need work.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.scheduled + self.running + self.retrying
    }
}
