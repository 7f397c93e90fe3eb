//! Postgres-backed cache engine.
//!
//! Entries live in the UNLOGGED `cache_entries` table so several processes can
//! share one cache. Expiry timestamps are computed with the database clock,
//! which keeps TTL semantics consistent across hosts with skewed clocks.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use super::store::{CacheBackend, CacheError, Remaining};

const BACKEND: &str = "postgres";

fn backend_error(op: &'static str) -> impl FnOnce(sqlx::Error) -> CacheError {
    move |err| CacheError::backend(BACKEND, op, err)
}

/// Longest lifetime written to the table; `timestamptz` cannot hold
/// `now() + Duration::MAX`.
const MAX_STORED_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn ttl_secs(ttl: Duration) -> f64 {
    ttl.min(MAX_STORED_TTL).as_secs_f64()
}

#[derive(Clone)]
pub struct PostgresCacheBackend {
    pool: PgPool,
}

impl PostgresCacheBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RemainingRow {
    persistent: bool,
    remaining_secs: f64,
}

#[async_trait]
impl CacheBackend for PostgresCacheBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT value
              FROM cache_entries
             WHERE key = $1
               AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error("get"))?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (
                $1,
                $2,
                CASE WHEN $3::float8 > 0
                     THEN now() + make_interval(secs => $3::float8)
                     ELSE NULL
                END
            )
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs(ttl))
        .execute(&self.pool)
        .await
        .map_err(backend_error("set"))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend_error("delete"))?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, CacheError> {
        // The conflict arm only fires for an expired row, so a live row yields
        // no RETURNING output. The row lock taken by ON CONFLICT serializes
        // concurrent callers.
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (
                $1,
                $2,
                CASE WHEN $3::float8 > 0
                     THEN now() + make_interval(secs => $3::float8)
                     ELSE NULL
                END
            )
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   expires_at = EXCLUDED.expires_at
             WHERE cache_entries.expires_at IS NOT NULL
               AND cache_entries.expires_at <= now()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error("set_nx"))?;

        Ok(row.is_some())
    }

    async fn replace(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        let result = sqlx::query(
            r#"
            UPDATE cache_entries
               SET value = $3
             WHERE key = $1
               AND value = $2
               AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(backend_error("replace"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn remaining(&self, key: &str) -> Result<Remaining, CacheError> {
        let row: Option<RemainingRow> = sqlx::query_as(
            r#"
            SELECT expires_at IS NULL AS persistent,
                   COALESCE(EXTRACT(EPOCH FROM (expires_at - now())), 0)::float8 AS remaining_secs
              FROM cache_entries
             WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error("remaining"))?;

        let remaining = match row {
            None => Remaining::Missing,
            Some(row) if row.persistent => Remaining::Persistent,
            Some(row) if row.remaining_secs > 0.0 => {
                Remaining::Expires(Duration::from_secs_f64(row.remaining_secs))
            }
            Some(_) => Remaining::Missing,
        };
        Ok(remaining)
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_error("purge_expired"))?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(backend_error("ping"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_ttl_is_capped() {
        assert_eq!(ttl_secs(Duration::from_millis(1500)), 1.5);
        assert_eq!(ttl_secs(Duration::MAX), MAX_STORED_TTL.as_secs_f64());
    }
}
