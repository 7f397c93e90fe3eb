//! Postgres queue engine on apalis-sql.
//!
//! Tasks are apalis jobs in `apalis.jobs` with `job_type` set to the queue
//! name, so each named queue is one [`PostgresStorage`] polled by its own
//! worker. apalis reserves with `FOR UPDATE SKIP LOCKED`, heartbeats its
//! workers and re-enqueues the jobs of workers that fall silent. This module
//! adds retry scheduling and the operator queries on top.

use std::convert::TryFrom;
use std::time::Duration;

use apalis::layers::WorkerBuilderExt;
use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::info;

use crate::domain::types::TaskState;

use super::backend::{AttemptFailure, Disposition, QueueBackend, QueueError, WorkerSpec};
use super::processor::process_task;
use super::task::{NewTask, QueueStats, QueuedTask, TaskRecord};

const BACKEND: &str = "postgres";
const SOURCE: &str = "queue::postgres";

/// Maps apalis job statuses onto task states.
const STATE_CASE: &str = r#"
    CASE
        WHEN status = 'Killed' THEN 'dead'
        WHEN status = 'Failed' AND attempts >= max_attempts THEN 'dead'
        WHEN status = 'Failed' THEN 'retrying'
        WHEN status = 'Running' THEN 'running'
        WHEN status = 'Done' THEN 'done'
        WHEN run_at > now() THEN 'scheduled'
        ELSE 'pending'
    END
"#;

const DEAD_FILTER: &str =
    "(status = 'Killed' OR (status = 'Failed' AND attempts >= max_attempts))";

fn backend_error(op: &'static str) -> impl FnOnce(sqlx::Error) -> QueueError {
    move |err| QueueError::backend(BACKEND, op, err)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    job: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    run_at: OffsetDateTime,
    last_error: Option<String>,
    lock_by: Option<String>,
    done_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for TaskRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = TaskState::try_from(row.state.as_str()).map_err(|_| {
            QueueError::backend(BACKEND, "decode", format!("unknown task state `{}`", row.state))
        })?;
        let body: QueuedTask = serde_json::from_value(row.job).map_err(|err| {
            QueueError::backend(BACKEND, "decode", format!("job `{}`: {err}", row.id))
        })?;

        Ok(Self {
            id: row.id,
            timeout: body.timeout(),
            task_type: body.task_type,
            payload: body.payload,
            queue: row.job_type,
            state,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            run_at: row.run_at,
            locked_by: row.lock_by,
            last_error: row.last_error,
            done_at: row.done_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresQueueBackend {
    pool: PgPool,
}

impl PostgresQueueBackend {
    /// Wrap a pool whose apalis schema is already migrated.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch one job for inspection.
    pub async fn find(&self, id: &str) -> Result<Option<TaskRecord>, QueueError> {
        let sql = format!(
            "SELECT id, job_type, job, {STATE_CASE} AS state, attempts, max_attempts, \
                    run_at, last_error, lock_by, done_at \
               FROM apalis.jobs WHERE id = $1"
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_error("find"))?;

        row.map(TaskRecord::try_from).transpose()
    }
}

#[async_trait]
impl QueueBackend for PostgresQueueBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn push(&self, task: NewTask) -> Result<String, QueueError> {
        let run_at = task.run_at(OffsetDateTime::now_utc())?;
        let job = serde_json::to_value(&task.body)
            .map_err(|err| QueueError::InvalidTask(err.to_string()))?;

        let (id,): (String,) = sqlx::query_as(
            r#"
            SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id
            "#,
        )
        .bind(&task.queue)
        .bind(job)
        .bind("Pending")
        .bind(run_at)
        .bind(task.max_attempts)
        .bind(0_i32)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_error("push"))?;

        Ok(id)
    }

    fn register(&self, monitor: Monitor, spec: WorkerSpec) -> Monitor {
        let keep_alive = (spec.orphan_after / 4).max(Duration::from_secs(1));
        let config = ApalisSqlConfig::new(&spec.queue)
            .set_poll_interval(spec.poll_interval)
            .set_keep_alive(keep_alive)
            .set_reenqueue_orphaned_after(spec.orphan_after);
        let storage: PostgresStorage<QueuedTask> =
            PostgresStorage::new_with_config(self.pool.clone(), config);

        let worker = WorkerBuilder::new(spec.name)
            .concurrency(spec.concurrency)
            .data(spec.context)
            .backend(storage)
            .build_fn(process_task);
        monitor.register(worker)
    }

    async fn settle_failure(&self, failure: &AttemptFailure<'_>) -> Result<Disposition, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(backend_error("settle_failure"))?;

        let held: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT attempts, max_attempts
              FROM apalis.jobs
             WHERE id = $1
               AND lock_by = $2
               AND status = 'Running'
               FOR UPDATE
            "#,
        )
        .bind(failure.id)
        .bind(failure.worker)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_error("settle_failure"))?;

        let Some((attempts, max_attempts)) = held else {
            return Ok(Disposition::Lost);
        };

        let attempt = attempts.saturating_add(1);
        if failure.permanent || attempt >= max_attempts {
            tx.commit().await.map_err(backend_error("settle_failure"))?;
            return Ok(Disposition::Dead { attempt });
        }

        let delay = failure.backoff.delay(attempt);
        sqlx::query(
            r#"
            UPDATE apalis.jobs
               SET run_at = now() + make_interval(secs => $2::float8 / 1000.0),
                   last_error = $3
             WHERE id = $1
            "#,
        )
        .bind(failure.id)
        .bind(millis(delay))
        .bind(failure.error)
        .execute(&mut *tx)
        .await
        .map_err(backend_error("settle_failure"))?;
        tx.commit().await.map_err(backend_error("settle_failure"))?;

        Ok(Disposition::Retry { attempt, delay })
    }

    async fn list_dead(&self, limit: u32) -> Result<Vec<TaskRecord>, QueueError> {
        let sql = format!(
            "SELECT id, job_type, job, 'dead' AS state, attempts, max_attempts, \
                    run_at, last_error, lock_by, done_at \
               FROM apalis.jobs \
              WHERE {DEAD_FILTER} \
              ORDER BY done_at DESC NULLS LAST \
              LIMIT $1"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error("list_dead"))?;

        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn requeue_dead(&self, id: Option<&str>) -> Result<u64, QueueError> {
        let sql = format!(
            "UPDATE apalis.jobs \
                SET status = 'Pending', \
                    attempts = 0, \
                    run_at = now(), \
                    lock_by = NULL, \
                    lock_at = NULL, \
                    done_at = NULL \
              WHERE {DEAD_FILTER} \
                AND ($1::text IS NULL OR id = $1)"
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_error("requeue_dead"))?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let sql = format!(
            "SELECT job_type, {STATE_CASE} AS state, COUNT(*)::int8 \
               FROM apalis.jobs \
              GROUP BY 1, 2 \
              ORDER BY 1"
        );
        let rows: Vec<(String, String, i64)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error("stats"))?;

        let mut stats: Vec<QueueStats> = Vec::new();
        for (queue, state, count) in rows {
            let state = TaskState::try_from(state.as_str()).map_err(|_| {
                QueueError::backend(BACKEND, "stats", format!("unknown task state `{state}`"))
            })?;
            let count = u64::try_from(count).unwrap_or(0);
            match stats.last_mut() {
                Some(entry) if entry.queue == queue => entry.record(state, count),
                _ => {
                    let mut entry = QueueStats::new(queue);
                    entry.record(state, count);
                    stats.push(entry);
                }
            }
        }
        Ok(stats)
    }

    async fn purge_done(&self) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM apalis.jobs WHERE status = 'Done'")
            .execute(&self.pool)
            .await
            .map_err(backend_error("purge_done"))?;

        if result.rows_affected() > 0 {
            info!(
                target = SOURCE,
                purged = result.rows_affected(),
                "purged completed tasks"
            );
        }
        Ok(result.rows_affected())
    }
}
