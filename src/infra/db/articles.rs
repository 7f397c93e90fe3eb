use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{ArticleReads, ArticleWrites, RepoError},
    domain::{entities::ArticleRecord, types::ArticleCounter},
};

use super::{PostgresRepositories, map_sqlx_error};

const ARTICLE_COLUMNS: &str =
    "id, slug, title, summary, content, is_published, likes, views, updated_at";

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: Uuid,
    slug: String,
    title: String,
    summary: String,
    content: String,
    is_published: bool,
    likes: i64,
    views: i64,
    updated_at: OffsetDateTime,
}

impl From<ArticleRow> for ArticleRecord {
    fn from(row: ArticleRow) -> Self {
        Self {
            id: row.id,
            slug: row.slug,
            title: row.title,
            summary: row.summary,
            content: row.content,
            is_published: row.is_published,
            likes: row.likes,
            views: row.views,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl ArticleReads for PostgresRepositories {
    async fn find_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1");
        let row: Option<ArticleRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(ArticleRecord::from))
    }

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<ArticleRecord>, RepoError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE slug = $1");
        let row: Option<ArticleRow> = sqlx::query_as(&sql)
            .bind(slug)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(ArticleRecord::from))
    }
}

#[async_trait]
impl ArticleWrites for Transaction<'static, Postgres> {
    async fn load_article(&mut self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1 FOR UPDATE");
        let row: Option<ArticleRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut **self)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(ArticleRecord::from))
    }

    async fn upsert_article(&mut self, article: &ArticleRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO articles
                (id, slug, title, summary, content, is_published, likes, views, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (id) DO UPDATE
               SET slug = EXCLUDED.slug,
                   title = EXCLUDED.title,
                   summary = EXCLUDED.summary,
                   content = EXCLUDED.content,
                   is_published = EXCLUDED.is_published,
                   updated_at = now()
            "#,
        )
        .bind(article.id)
        .bind(&article.slug)
        .bind(&article.title)
        .bind(&article.summary)
        .bind(&article.content)
        .bind(article.is_published)
        .bind(article.likes)
        .bind(article.views)
        .execute(&mut **self)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn delete_article(&mut self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM articles WHERE id = $1")
            .bind(id)
            .execute(&mut **self)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn increment_counter(
        &mut self,
        id: Uuid,
        counter: ArticleCounter,
    ) -> Result<bool, RepoError> {
        let column = counter.as_str();
        let sql = format!("UPDATE articles SET {column} = {column} + 1 WHERE id = $1");
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&mut **self)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}
