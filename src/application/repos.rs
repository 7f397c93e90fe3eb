//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::ArticleRecord;
use crate::domain::types::ArticleCounter;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Committed-state reads of articles, outside any transaction.
#[async_trait]
pub trait ArticleReads: Send + Sync {
    async fn find_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError>;

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<ArticleRecord>, RepoError>;
}

/// Article writes performed inside an open transaction.
#[async_trait]
pub trait ArticleWrites: Send {
    /// Read an article as seen by this transaction.
    async fn load_article(&mut self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError>;

    async fn upsert_article(&mut self, article: &ArticleRecord) -> Result<(), RepoError>;

    /// Returns whether a row was deleted.
    async fn delete_article(&mut self, id: Uuid) -> Result<bool, RepoError>;

    /// Add one to a counter column; returns whether the article exists.
    async fn increment_counter(
        &mut self,
        id: Uuid,
        counter: ArticleCounter,
    ) -> Result<bool, RepoError>;
}
