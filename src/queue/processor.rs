//! Consumer side of the invalidation queue.
//!
//! Every configured queue gets its own apalis worker with a share of the
//! processor's concurrency proportional to the queue's weight, all under one
//! [`Monitor`]. Each attempt runs under the task's own timeout. Failed
//! attempts are retried with exponential backoff until the retry budget is
//! spent, after which the task rests in the dead set.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use apalis::prelude::{Data, Error as ApalisError, Monitor, TaskId};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backend::{AttemptFailure, Disposition, QueueBackend, QueueError, WorkerSpec};
use super::config::{QueueConfig, RetryBackoff};
use super::handler::{HandlerError, HandlerTable};
use super::task::{Delivery, QueuedTask};

const SOURCE: &str = "queue::processor";

type BoxError = Box<dyn Error + Send + Sync + 'static>;

fn job_failed<E>(err: E) -> ApalisError
where
    E: Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}

fn job_aborted<E>(err: E) -> ApalisError
where
    E: Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Abort(Arc::new(boxed))
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// In-flight attempts that finished after shutdown was requested.
    pub drained: usize,
    /// Attempts cut off at the shutdown timeout; they are redelivered once
    /// this worker's heartbeat lapses.
    pub abandoned: usize,
}

/// Attempt counters shared by the workers of one processor run.
#[derive(Debug, Default)]
struct Tally {
    started: AtomicUsize,
    finished: AtomicUsize,
    finished_at_signal: AtomicUsize,
}

impl Tally {
    fn mark_signal(&self) {
        self.finished_at_signal
            .store(self.finished.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn report(&self) -> ShutdownReport {
        let started = self.started.load(Ordering::SeqCst);
        let finished = self.finished.load(Ordering::SeqCst);
        ShutdownReport {
            drained: finished.saturating_sub(self.finished_at_signal.load(Ordering::SeqCst)),
            abandoned: started.saturating_sub(finished),
        }
    }
}

/// State handed to every attempt of one queue's worker.
#[derive(Clone)]
pub struct WorkerContext {
    queue: String,
    worker: String,
    backend: Arc<dyn QueueBackend>,
    handlers: HandlerTable,
    backoff: RetryBackoff,
    tally: Arc<Tally>,
}

pub struct Processor {
    backend: Arc<dyn QueueBackend>,
    handlers: HandlerTable,
    config: QueueConfig,
    started: AtomicBool,
}

/// Handle to a running processor.
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<ShutdownReport>,
}

impl ProcessorHandle {
    /// Stop fetching, wait for in-flight attempts up to the shutdown timeout,
    /// then abandon the rest.
    pub async fn shutdown(self) -> ShutdownReport {
        let _ = self.shutdown.send(true);
        match self.join.await {
            Ok(report) => report,
            Err(err) => {
                error!(target = SOURCE, error = %err, "queue monitor terminated abnormally");
                ShutdownReport::default()
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Processor {
    pub fn new(backend: Arc<dyn QueueBackend>, handlers: HandlerTable, config: QueueConfig) -> Self {
        Self {
            backend,
            handlers,
            config,
            started: AtomicBool::new(false),
        }
    }

    /// Register one worker per queue and spawn the monitor. A processor can
    /// only be started once.
    pub fn start(&self) -> Result<ProcessorHandle, QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        let tally = Arc::new(Tally::default());
        let backoff = self.config.backoff();
        let mut monitor = Monitor::new().shutdown_timeout(self.config.shutdown_timeout);

        for (queue, concurrency) in self.config.queue_concurrency() {
            let name = format!("{queue}-{}", Uuid::new_v4().simple());
            info!(
                target = SOURCE,
                worker = %name,
                queue = %queue,
                backend = self.backend.name(),
                concurrency,
                "registering queue worker"
            );
            let context = WorkerContext {
                queue: queue.clone(),
                worker: name.clone(),
                backend: Arc::clone(&self.backend),
                handlers: self.handlers.clone(),
                backoff,
                tally: Arc::clone(&tally),
            };
            monitor = self.backend.register(
                monitor,
                WorkerSpec {
                    name,
                    queue,
                    concurrency,
                    poll_interval: self.config.poll_interval,
                    orphan_after: self.config.orphan_after,
                    context,
                },
            );
        }

        let (shutdown, mut receiver) = watch::channel(false);
        let signal_tally = Arc::clone(&tally);
        let signal = async move {
            let _ = receiver.changed().await;
            signal_tally.mark_signal();
            Ok(())
        };

        let join = tokio::spawn(async move {
            if let Err(err) = monitor.run_with_signal(signal).await {
                error!(target = SOURCE, error = %err, "queue monitor stopped");
            }
            let report = tally.report();
            info!(
                target = SOURCE,
                drained = report.drained,
                abandoned = report.abandoned,
                "queue processor stopped"
            );
            report
        });

        Ok(ProcessorHandle { shutdown, join })
    }
}

/// apalis entry point for one delivery of a task.
#[instrument(skip_all, fields(task_id = %task_id, task_type = %task.task_type))]
pub(crate) async fn process_task(
    task: QueuedTask,
    task_id: TaskId,
    context: Data<WorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;
    let id = task.id.clone().unwrap_or_else(|| task_id.to_string());

    ctx.tally.started.fetch_add(1, Ordering::SeqCst);
    let result = attempt(ctx, &id, &task).await;
    ctx.tally.finished.fetch_add(1, Ordering::SeqCst);
    result
}

async fn attempt(ctx: &WorkerContext, id: &str, task: &QueuedTask) -> Result<(), ApalisError> {
    if let Err(err) = ctx.backend.mark_running(id, &ctx.worker).await {
        warn!(target = SOURCE, task_id = %id, error = %err, "failed to record delivery");
    }

    let delivery = Delivery {
        id: id.to_string(),
        queue: ctx.queue.clone(),
        task_type: task.task_type.clone(),
        payload: task.payload.clone(),
    };
    let timeout = task.timeout();
    let started = Instant::now();
    let outcome = match ctx.handlers.get(&task.task_type) {
        None => Err(HandlerError::Unregistered(task.task_type.clone())),
        Some(handler) => match tokio::time::timeout(timeout, handler.handle(&delivery)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::TimedOut(timeout)),
        },
    };
    histogram!("scriptorium_queue_attempt_seconds", "queue" => ctx.queue.clone())
        .record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(()) => {
            counter!("scriptorium_queue_processed_total", "queue" => ctx.queue.clone())
                .increment(1);
            if let Err(err) = ctx.backend.mark_done(id).await {
                warn!(target = SOURCE, task_id = %id, error = %err, "failed to record completion");
            }
            debug!(target = SOURCE, task_id = %id, task_type = %task.task_type, "task completed");
            Ok(())
        }
        Err(err) => fail(ctx, id, task, err).await,
    }
}

async fn fail(
    ctx: &WorkerContext,
    id: &str,
    task: &QueuedTask,
    err: HandlerError,
) -> Result<(), ApalisError> {
    let message = err.to_string();
    let failure = AttemptFailure {
        id,
        worker: &ctx.worker,
        queue: &ctx.queue,
        task,
        error: &message,
        permanent: err.is_permanent(),
        backoff: ctx.backoff,
    };

    match ctx.backend.settle_failure(&failure).await {
        Ok(Disposition::Retry { attempt, delay }) => {
            counter!("scriptorium_queue_retried_total", "queue" => ctx.queue.clone()).increment(1);
            warn!(
                target = SOURCE,
                task_id = %id,
                task_type = %task.task_type,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "task attempt failed; scheduling retry"
            );
            Err(job_failed(err))
        }
        Ok(Disposition::Dead { attempt }) => {
            counter!("scriptorium_queue_dead_total", "queue" => ctx.queue.clone()).increment(1);
            error!(
                target = SOURCE,
                task_id = %id,
                task_type = %task.task_type,
                attempt,
                payload = %task.payload,
                error = %message,
                "task moved to the dead set"
            );
            Err(job_aborted(err))
        }
        Ok(Disposition::Lost) => {
            warn!(
                target = SOURCE,
                task_id = %id,
                worker = %ctx.worker,
                error = %message,
                "reservation lost before the failure was recorded"
            );
            Err(job_failed(err))
        }
        Err(store_err) => {
            warn!(
                target = SOURCE,
                task_id = %id,
                error = %store_err,
                "failed to record attempt failure; the task will be redelivered"
            );
            Err(job_failed(err))
        }
    }
}
