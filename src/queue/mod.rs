//! Durable invalidation queue.
//!
//! [`Distributor`] persists typed tasks; [`Processor`] runs one apalis worker
//! per named queue, sized by the queue's weight, and hands deliveries to
//! registered [`TaskHandler`]s. Delivery is at-least-once, so handlers must be
//! idempotent.
//!
//! ## Configuration
//!
//! ```toml
//! [queue]
//! backend = "postgres"
//! concurrency = 10
//! default_queue = "critical"
//! default_max_retry = 3
//! default_timeout_ms = 3000
//! orphan_after_secs = 120
//!
//! [queue.weights]
//! critical = 10
//! default = 5
//! ```

mod backend;
mod config;
mod distributor;
mod handler;
mod memory;
mod postgres;
mod processor;
mod task;

pub use backend::{AttemptFailure, Disposition, QueueBackend, QueueError, WorkerSpec};
pub use config::{QueueConfig, QueuePolicy, RetryBackoff};
pub use distributor::Distributor;
pub use handler::{DeleteCacheKeysHandler, HandlerError, HandlerTable, TaskHandler};
pub use memory::MemoryQueueBackend;
pub use postgres::PostgresQueueBackend;
pub use processor::{Processor, ProcessorHandle, ShutdownReport, WorkerContext};
pub use task::{
    DeleteCacheKeysPayload, Delivery, EnqueueOptions, MAX_PROCESS_IN, MAX_RETRY,
    MAX_TASK_TIMEOUT, NewTask, QUEUE_CRITICAL, QUEUE_DEFAULT, QueueStats, QueuedTask,
    TASK_DELETE_CACHE_KEYS, Task, TaskRecord,
};
