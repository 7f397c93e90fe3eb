//! Queue runtime configuration.

use std::time::Duration;

use super::task::{EnqueueOptions, QUEUE_CRITICAL, QUEUE_DEFAULT};

const DEFAULT_MAX_RETRY: u32 = 3;
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_ORPHAN_AFTER: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delivery policy applied to invalidation tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    pub max_retry: u32,
    pub timeout: Duration,
    pub queue: String,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TASK_TIMEOUT,
            queue: QUEUE_CRITICAL.to_string(),
        }
    }
}

impl QueuePolicy {
    pub fn options(&self) -> EnqueueOptions {
        EnqueueOptions {
            max_retry: self.max_retry,
            timeout: self.timeout,
            process_in: Duration::ZERO,
            queue: self.queue.clone(),
            deadline: None,
        }
    }
}

/// Exponential delay between failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    /// Delay before the next delivery after `attempts` failed deliveries.
    ///
    /// Doubles from `base` and saturates at `max`.
    pub fn delay(&self, attempts: i32) -> Duration {
        let exponent = u32::try_from(attempts.saturating_sub(1)).unwrap_or(0).min(20);
        self.base.saturating_mul(1_u32 << exponent).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Named queues and their relative dispatch weights.
    pub weights: Vec<(String, u32)>,
    /// Workers shared by all queues, split by weight.
    pub concurrency: usize,
    /// Idle wait between polls of an empty queue.
    pub poll_interval: Duration,
    /// Heartbeat silence after which a worker's reservations are redelivered.
    pub orphan_after: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How long shutdown waits for in-flight tasks before abandoning them.
    pub shutdown_timeout: Duration,
    /// Upper bound on a single enqueue.
    pub enqueue_timeout: Duration,
    pub policy: QueuePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            weights: vec![
                (QUEUE_CRITICAL.to_string(), 10),
                (QUEUE_DEFAULT.to_string(), 5),
            ],
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            orphan_after: DEFAULT_ORPHAN_AFTER,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            policy: QueuePolicy::default(),
        }
    }
}

impl From<&crate::config::QueueSettings> for QueueConfig {
    fn from(settings: &crate::config::QueueSettings) -> Self {
        Self {
            weights: settings
                .weights
                .iter()
                .map(|(queue, weight)| (queue.clone(), weight.get()))
                .collect(),
            concurrency: settings.concurrency.get() as usize,
            poll_interval: settings.poll_interval,
            orphan_after: settings.orphan_after,
            retry_base_delay: settings.retry_base_delay,
            retry_max_delay: settings.retry_max_delay,
            shutdown_timeout: settings.shutdown_timeout,
            enqueue_timeout: settings.enqueue_timeout,
            policy: QueuePolicy {
                max_retry: settings.default_max_retry,
                timeout: settings.default_timeout,
                queue: settings.default_queue.clone(),
            },
        }
    }
}

impl QueueConfig {
    pub fn knows_queue(&self, queue: &str) -> bool {
        self.weights.iter().any(|(name, _)| name == queue)
    }

    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff {
            base: self.retry_base_delay,
            max: self.retry_max_delay,
        }
    }

    /// Worker count per queue, proportional to its weight and at least one.
    pub fn queue_concurrency(&self) -> Vec<(String, usize)> {
        let total_weight: u64 = self
            .weights
            .iter()
            .map(|(_, weight)| u64::from(*weight))
            .sum::<u64>()
            .max(1);
        let concurrency = self.concurrency as u64;

        self.weights
            .iter()
            .map(|(queue, weight)| {
                let share = concurrency.saturating_mul(u64::from(*weight)) / total_weight;
                (queue.clone(), usize::try_from(share).unwrap_or(usize::MAX).max(1))
            })
            .collect()
    }
}
