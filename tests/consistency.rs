//! Write paths commit first and invalidate afterwards through the queue.

mod common;

use std::time::Duration;

use common::{Harness, evicted, queue_drained};
use scriptorium::application::articles::{ArticleUpdate, NewArticle};
use scriptorium::application::error::AppError;
use scriptorium::domain::entities::ArticleRecord;
use scriptorium::domain::keys::CacheKey;
use scriptorium::domain::types::TaskState;
use scriptorium::queue::{DeleteCacheKeysPayload, TASK_DELETE_CACHE_KEYS};
use scriptorium::tx::CommitFailure;
use uuid::Uuid;

const SETTLE: Duration = Duration::from_secs(5);

fn new_article(slug: &str) -> NewArticle {
    NewArticle {
        slug: slug.to_string(),
        title: "First title".to_string(),
        summary: "Summary".to_string(),
        content: "Body".to_string(),
        is_published: true,
    }
}

async fn cached(harness: &Harness, key: &CacheKey) -> Option<ArticleRecord> {
    harness
        .cache
        .get::<ArticleRecord>(&key.render())
        .await
        .expect("memory cache never fails")
}

#[tokio::test]
async fn update_is_visible_once_invalidation_runs() {
    let harness = Harness::new(true);
    let created = harness
        .service
        .create_article(new_article("consistency"))
        .await
        .expect("create article");

    let id_key = CacheKey::article(created.id);
    assert!(queue_drained(harness.queue.as_ref(), SETTLE).await);

    let first = harness.service.get_article(created.id).await.unwrap().unwrap();
    assert_eq!(first.title, "First title");
    assert!(cached(&harness, &id_key).await.is_some());

    harness
        .service
        .update_article(
            created.id,
            ArticleUpdate {
                title: Some("Second title".to_string()),
                ..ArticleUpdate::default()
            },
        )
        .await
        .expect("update article");

    assert!(evicted(&harness.cache, &id_key, SETTLE).await);

    let second = harness.service.get_article(created.id).await.unwrap().unwrap();
    assert_eq!(second.title, "Second title");

    harness.shutdown().await;
}

#[tokio::test]
async fn slug_change_drops_entries_under_both_slugs() {
    let harness = Harness::new(true);
    let created = harness
        .service
        .create_article(new_article("old-slug"))
        .await
        .unwrap();
    assert!(queue_drained(harness.queue.as_ref(), SETTLE).await);

    assert!(
        harness
            .service
            .get_article_by_slug("old-slug")
            .await
            .unwrap()
            .is_some()
    );

    harness
        .service
        .update_article(
            created.id,
            ArticleUpdate {
                slug: Some("new-slug".to_string()),
                ..ArticleUpdate::default()
            },
        )
        .await
        .unwrap();

    let old_key = CacheKey::article_slug("old-slug");
    assert!(evicted(&harness.cache, &old_key, SETTLE).await);
    assert!(
        harness
            .service
            .get_article_by_slug("old-slug")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        harness
            .service
            .get_article_by_slug("new-slug")
            .await
            .unwrap()
            .map(|article| article.id),
        Some(created.id)
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn committed_update_enqueues_one_deduplicated_task() {
    let harness = Harness::new(false);
    let created = harness
        .service
        .create_article(new_article("queued"))
        .await
        .unwrap();

    harness
        .service
        .update_article(
            created.id,
            ArticleUpdate {
                content: Some("Edited".to_string()),
                ..ArticleUpdate::default()
            },
        )
        .await
        .unwrap();

    let tasks = harness.queue.snapshot();
    assert_eq!(tasks.len(), 2);
    let update_task = &tasks[1];
    assert_eq!(update_task.task_type, TASK_DELETE_CACHE_KEYS);
    assert_eq!(update_task.state, TaskState::Pending);
    assert_eq!(update_task.queue, "critical");
    assert_eq!(update_task.max_attempts, 4);
    assert_eq!(update_task.timeout, Duration::from_secs(3));

    let payload: DeleteCacheKeysPayload =
        serde_json::from_value(update_task.payload.clone()).unwrap();
    assert_eq!(
        payload.keys,
        vec![
            CacheKey::article(created.id).render(),
            CacheKey::article_slug("queued").render(),
        ]
    );
}

#[tokio::test]
async fn failed_writes_enqueue_nothing() {
    let harness = Harness::new(false);

    let missing = harness
        .service
        .update_article(
            Uuid::new_v4(),
            ArticleUpdate {
                title: Some("Nope".to_string()),
                ..ArticleUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(missing, AppError::NotFound));
    assert!(harness.queue.snapshot().is_empty());

    let invalid = harness
        .service
        .create_article(new_article("Not A Slug"))
        .await
        .unwrap_err();
    assert!(matches!(invalid, AppError::Validation(_)));
    assert!(harness.queue.snapshot().is_empty());
}

#[tokio::test]
async fn commit_failure_discards_pending_invalidation() {
    let harness = Harness::new(false);
    harness
        .service
        .create_article(new_article("taken"))
        .await
        .unwrap();
    let before = harness.queue.snapshot().len();

    let duplicate = harness
        .service
        .create_article(new_article("taken"))
        .await
        .unwrap_err();
    assert!(matches!(
        duplicate,
        AppError::Transaction(CommitFailure::Commit(_))
    ));

    harness.store.fail_next_commit();
    let created_before = harness.store.commits();
    let injected = harness
        .service
        .create_article(new_article("fresh"))
        .await
        .unwrap_err();
    assert!(matches!(injected, AppError::Transaction(_)));
    assert_eq!(harness.store.commits(), created_before);

    assert_eq!(harness.queue.snapshot().len(), before);
}

#[tokio::test]
async fn delete_invalidates_and_reads_then_miss() {
    let harness = Harness::new(true);
    let created = harness
        .service
        .create_article(new_article("short-lived"))
        .await
        .unwrap();
    assert!(queue_drained(harness.queue.as_ref(), SETTLE).await);
    assert!(harness.service.get_article(created.id).await.unwrap().is_some());

    harness.service.delete_article(created.id).await.unwrap();

    let id_key = CacheKey::article(created.id);
    assert!(evicted(&harness.cache, &id_key, SETTLE).await);
    assert!(harness.service.get_article(created.id).await.unwrap().is_none());

    let again = harness.service.delete_article(created.id).await.unwrap_err();
    assert!(matches!(again, AppError::NotFound));

    harness.shutdown().await;
}
