//! Postgres primary store for articles, plus the pool shared with the
//! Postgres cache and queue engines.

mod articles;
mod util;

pub use util::map_sqlx_error;

use std::time::Duration;

use apalis_sql::postgres::PostgresStorage;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::{config::DatabaseSettings, infra::error::InfraError};

const SOURCE: &str = "infra::db";
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply the apalis job schema, then this crate's tables.
///
/// Both migration sets share sqlx's bookkeeping table, so each run ignores
/// versions that belong to the other.
pub async fn run_migrations(pool: &PgPool) -> Result<(), InfraError> {
    PostgresStorage::<()>::setup(pool)
        .await
        .map_err(InfraError::database("apalis migrations"))?;

    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: PgPool,
}

impl PostgresRepositories {
    /// Wrap an already migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with `settings` and apply pending migrations.
    pub async fn open(settings: &DatabaseSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InfraError::configuration("database.url is not configured"))?;

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.get())
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(InfraError::database("connect"))?;

        run_migrations(&pool).await?;
        info!(
            target = SOURCE,
            max_connections = settings.max_connections.get(),
            "database ready"
        );

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), InfraError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(InfraError::database("health check"))?;
        Ok(())
    }
}
