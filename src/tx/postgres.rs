//! Postgres primary store.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use crate::application::repos::RepoError;
use crate::infra::db::{PostgresRepositories, map_sqlx_error};

use super::PrimaryStore;

#[async_trait]
impl PrimaryStore for PostgresRepositories {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, RepoError> {
        self.pool().begin().await.map_err(map_sqlx_error)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), RepoError> {
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), RepoError> {
        tx.rollback().await.map_err(map_sqlx_error)
    }
}
