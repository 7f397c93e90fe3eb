//! Article reads and writes wired through the consistency core.
//!
//! Reads are cache-aside. Content writes commit through the transactional
//! mutator and invalidate every key the article may be cached under. Counters
//! are guarded per actor and left stale in cache until the entry expires.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    application::{
        error::AppError,
        repos::{ArticleReads, ArticleWrites},
    },
    cache::{CacheConfig, CacheStore, IdempotencyGuard, read_through},
    domain::{
        entities::ArticleRecord,
        keys::{ActorIdentity, CacheKey, GuardedAction, IdempotencyKey},
        types::ArticleCounter,
    },
    tx::{PrimaryStore, TransactionalMutator},
};

const SOURCE: &str = "application::articles";

/// Result of a guarded counter action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Applied,
    /// The actor already performed this action within the window.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct NewArticle {
    pub slug: String,
    pub title: String,
    pub summary: String,
    pub content: String,
    pub is_published: bool,
}

/// Partial update; `None` fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct ArticleUpdate {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub is_published: Option<bool>,
}

impl ArticleUpdate {
    fn apply(self, article: &mut ArticleRecord) {
        if let Some(slug) = self.slug {
            article.slug = slug;
        }
        if let Some(title) = self.title {
            article.title = title;
        }
        if let Some(summary) = self.summary {
            article.summary = summary;
        }
        if let Some(content) = self.content {
            article.content = content;
        }
        if let Some(is_published) = self.is_published {
            article.is_published = is_published;
        }
    }
}

fn validate_slug(slug: &str) -> Result<(), AppError> {
    let valid = !slug.is_empty()
        && slug
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    if valid {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "slug `{slug}` must be non-empty lowercase ascii, digits or dashes"
        )))
    }
}

pub struct ArticleService<S: PrimaryStore> {
    mutator: TransactionalMutator<S>,
    cache: CacheStore,
    cache_config: CacheConfig,
    guard: IdempotencyGuard,
}

impl<S> ArticleService<S>
where
    S: PrimaryStore + ArticleReads,
    S::Tx: ArticleWrites,
{
    pub fn new(
        mutator: TransactionalMutator<S>,
        cache: CacheStore,
        cache_config: CacheConfig,
        guard: IdempotencyGuard,
    ) -> Self {
        Self {
            mutator,
            cache,
            cache_config,
            guard,
        }
    }

    pub async fn get_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, AppError> {
        let store = self.mutator.store();
        read_through(&self.cache, &self.cache_config, &CacheKey::article(id), || {
            store.find_article(id)
        })
        .await
        .map_err(AppError::from)
    }

    pub async fn get_article_by_slug(&self, slug: &str) -> Result<Option<ArticleRecord>, AppError> {
        let store = self.mutator.store();
        read_through(
            &self.cache,
            &self.cache_config,
            &CacheKey::article_slug(slug),
            || store.find_article_by_slug(slug),
        )
        .await
        .map_err(AppError::from)
    }

    pub async fn create_article(&self, new: NewArticle) -> Result<ArticleRecord, AppError> {
        validate_slug(&new.slug)?;
        let article = ArticleRecord {
            id: Uuid::new_v4(),
            slug: new.slug,
            title: new.title,
            summary: new.summary,
            content: new.content,
            is_published: new.is_published,
            likes: 0,
            views: 0,
            updated_at: OffsetDateTime::now_utc(),
        };

        let created = self
            .mutator
            .execute(move |scope| {
                Box::pin(async move {
                    scope.tx().upsert_article(&article).await?;
                    scope.invalidate([
                        CacheKey::article(article.id),
                        CacheKey::article_slug(&article.slug),
                    ]);
                    Ok::<_, AppError>(article)
                })
            })
            .await?;

        info!(target = SOURCE, article_id = %created.id, slug = %created.slug, "article created");
        Ok(created)
    }

    /// Apply `update`, invalidating the id key plus the old and new slug keys.
    pub async fn update_article(
        &self,
        id: Uuid,
        update: ArticleUpdate,
    ) -> Result<ArticleRecord, AppError> {
        if let Some(slug) = update.slug.as_deref() {
            validate_slug(slug)?;
        }

        let updated = self
            .mutator
            .execute(move |scope| {
                Box::pin(async move {
                    let Some(mut article) = scope.tx().load_article(id).await? else {
                        return Err(AppError::NotFound);
                    };
                    let previous_slug = article.slug.clone();
                    update.apply(&mut article);
                    article.updated_at = OffsetDateTime::now_utc();
                    scope.tx().upsert_article(&article).await?;
                    scope.invalidate([
                        CacheKey::article(id),
                        CacheKey::article_slug(&previous_slug),
                        CacheKey::article_slug(&article.slug),
                    ]);
                    Ok(article)
                })
            })
            .await?;

        info!(target = SOURCE, article_id = %id, "article updated");
        Ok(updated)
    }

    pub async fn delete_article(&self, id: Uuid) -> Result<(), AppError> {
        self.mutator
            .execute(move |scope| {
                Box::pin(async move {
                    let Some(article) = scope.tx().load_article(id).await? else {
                        return Err(AppError::NotFound);
                    };
                    scope.tx().delete_article(id).await?;
                    scope.invalidate([
                        CacheKey::article(id),
                        CacheKey::article_slug(&article.slug),
                    ]);
                    Ok(())
                })
            })
            .await?;

        info!(target = SOURCE, article_id = %id, "article deleted");
        Ok(())
    }

    pub async fn like(
        &self,
        id: Uuid,
        actor: ActorIdentity,
    ) -> Result<ReactionOutcome, AppError> {
        self.react(id, actor, GuardedAction::Like, ArticleCounter::Likes)
            .await
    }

    pub async fn view(
        &self,
        id: Uuid,
        actor: ActorIdentity,
    ) -> Result<ReactionOutcome, AppError> {
        self.react(id, actor, GuardedAction::View, ArticleCounter::Views)
            .await
    }

    async fn react(
        &self,
        id: Uuid,
        actor: ActorIdentity,
        action: GuardedAction,
        counter: ArticleCounter,
    ) -> Result<ReactionOutcome, AppError> {
        let key = IdempotencyKey::article(id, actor, action);
        if !self.guard.acquire(&key, Duration::ZERO).await? {
            return Ok(ReactionOutcome::Duplicate);
        }

        let outcome = self
            .mutator
            .execute(move |scope| {
                Box::pin(async move {
                    if scope.tx().increment_counter(id, counter).await? {
                        Ok(())
                    } else {
                        Err(AppError::NotFound)
                    }
                })
            })
            .await;

        if let Err(err) = outcome {
            // The claim must not outlive an action that never happened.
            if let Err(release_err) = self.guard.release(&key).await {
                warn!(
                    target = SOURCE,
                    article_id = %id,
                    action = action.as_str(),
                    error = %release_err,
                    "failed to release idempotency claim"
                );
            }
            return Err(err);
        }

        Ok(ReactionOutcome::Applied)
    }
}
