//! Process-local primary store.
//!
//! Transactions journal their writes and apply them atomically at commit, so
//! uncommitted work is invisible to other readers and rollback is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{ArticleReads, ArticleWrites, RepoError};
use crate::domain::entities::ArticleRecord;
use crate::domain::types::ArticleCounter;
use crate::util::lock::mutex_lock;

use super::PrimaryStore;

const SOURCE: &str = "tx::memory";

#[derive(Debug, Default)]
struct MemoryState {
    articles: Mutex<HashMap<Uuid, ArticleRecord>>,
    commits: AtomicUsize,
    fail_next_commit: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPrimaryStore {
    state: Arc<MemoryState>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `article` directly as committed state.
    pub fn seed(&self, article: ArticleRecord) {
        mutex_lock(&self.state.articles, SOURCE, "seed").insert(article.id, article);
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Make the next commit fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.state.fail_next_commit.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum MemoryOp {
    Upsert(ArticleRecord),
    Delete(Uuid),
    Increment(Uuid, ArticleCounter),
}

impl MemoryOp {
    fn apply(&self, articles: &mut HashMap<Uuid, ArticleRecord>) {
        match self {
            MemoryOp::Upsert(article) => {
                articles.insert(article.id, article.clone());
            }
            MemoryOp::Delete(id) => {
                articles.remove(id);
            }
            MemoryOp::Increment(id, counter) => {
                if let Some(article) = articles.get_mut(id) {
                    match counter {
                        ArticleCounter::Likes => article.likes += 1,
                        ArticleCounter::Views => article.views += 1,
                    }
                }
            }
        }
    }

    fn touches(&self, target: Uuid) -> bool {
        match self {
            MemoryOp::Upsert(article) => article.id == target,
            MemoryOp::Delete(id) | MemoryOp::Increment(id, _) => *id == target,
        }
    }
}

/// Open transaction against a [`MemoryPrimaryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    state: Arc<MemoryState>,
    ops: Vec<MemoryOp>,
}

impl MemoryTx {
    fn view(&self, id: Uuid) -> Option<ArticleRecord> {
        let mut scratch = HashMap::new();
        if let Some(committed) = mutex_lock(&self.state.articles, SOURCE, "view").get(&id) {
            scratch.insert(id, committed.clone());
        }
        for op in self.ops.iter().filter(|op| op.touches(id)) {
            op.apply(&mut scratch);
        }
        scratch.remove(&id)
    }
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, RepoError> {
        Ok(MemoryTx {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), RepoError> {
        if self.state.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(RepoError::from_persistence("injected commit failure"));
        }

        let mut articles = mutex_lock(&self.state.articles, SOURCE, "commit");
        let mut next = articles.clone();
        for op in &tx.ops {
            op.apply(&mut next);
        }

        let slugs_unique = {
            let mut slugs = HashSet::new();
            next.values().all(|article| slugs.insert(article.slug.as_str()))
        };
        if !slugs_unique {
            return Err(RepoError::Duplicate {
                constraint: "articles_slug_key".to_string(),
            });
        }

        *articles = next;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), RepoError> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl ArticleReads for MemoryPrimaryStore {
    async fn find_article(&self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError> {
        Ok(mutex_lock(&self.state.articles, SOURCE, "find_article")
            .get(&id)
            .cloned())
    }

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<ArticleRecord>, RepoError> {
        Ok(mutex_lock(&self.state.articles, SOURCE, "find_article_by_slug")
            .values()
            .find(|article| article.slug == slug)
            .cloned())
    }
}

#[async_trait]
impl ArticleWrites for MemoryTx {
    async fn load_article(&mut self, id: Uuid) -> Result<Option<ArticleRecord>, RepoError> {
        Ok(self.view(id))
    }

    async fn upsert_article(&mut self, article: &ArticleRecord) -> Result<(), RepoError> {
        let mut article = article.clone();
        article.updated_at = OffsetDateTime::now_utc();
        self.ops.push(MemoryOp::Upsert(article));
        Ok(())
    }

    async fn delete_article(&mut self, id: Uuid) -> Result<bool, RepoError> {
        if self.view(id).is_none() {
            return Ok(false);
        }
        self.ops.push(MemoryOp::Delete(id));
        Ok(true)
    }

    async fn increment_counter(
        &mut self,
        id: Uuid,
        counter: ArticleCounter,
    ) -> Result<bool, RepoError> {
        if self.view(id).is_none() {
            return Ok(false);
        }
        self.ops.push(MemoryOp::Increment(id, counter));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(slug: &str) -> ArticleRecord {
        ArticleRecord {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            title: "Title".to_string(),
            summary: String::new(),
            content: "Body".to_string(),
            is_published: true,
            likes: 0,
            views: 0,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_until_commit() {
        let store = MemoryPrimaryStore::new();
        let record = article("hello");
        store.seed(record.clone());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.increment_counter(record.id, ArticleCounter::Likes).await.unwrap());
        assert_eq!(tx.load_article(record.id).await.unwrap().unwrap().likes, 1);
        assert_eq!(store.find_article(record.id).await.unwrap().unwrap().likes, 0);

        store.commit(tx).await.unwrap();
        assert_eq!(store.find_article(record.id).await.unwrap().unwrap().likes, 1);
    }

    #[tokio::test]
    async fn rollback_discards_journal() {
        let store = MemoryPrimaryStore::new();
        let record = article("hello");
        store.seed(record.clone());

        let mut tx = store.begin().await.unwrap();
        assert!(tx.delete_article(record.id).await.unwrap());
        store.rollback(tx).await.unwrap();

        assert!(store.find_article(record.id).await.unwrap().is_some());
        assert_eq!(store.commits(), 0);
    }

    #[tokio::test]
    async fn duplicate_slug_fails_commit_atomically() {
        let store = MemoryPrimaryStore::new();
        let existing = article("taken");
        store.seed(existing.clone());

        let mut tx = store.begin().await.unwrap();
        tx.increment_counter(existing.id, ArticleCounter::Views)
            .await
            .unwrap();
        tx.upsert_article(&article("taken")).await.unwrap();

        let err = store.commit(tx).await.unwrap_err();
        assert!(matches!(err, RepoError::Duplicate { .. }));
        assert_eq!(store.find_article(existing.id).await.unwrap().unwrap().views, 0);
    }

    #[tokio::test]
    async fn counters_on_missing_article_report_absent() {
        let store = MemoryPrimaryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(!tx.increment_counter(Uuid::new_v4(), ArticleCounter::Likes).await.unwrap());
        assert!(!tx.delete_article(Uuid::new_v4()).await.unwrap());
    }
}
