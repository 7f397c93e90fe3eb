#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scriptorium::application::articles::ArticleService;
use scriptorium::cache::{CacheConfig, CacheStore, IdempotencyGuard};
use scriptorium::domain::keys::CacheKey;
use scriptorium::queue::{
    Distributor, HandlerTable, MemoryQueueBackend, Processor, ProcessorHandle, QueueBackend,
    QueueConfig, QueueStats,
};
use scriptorium::tx::{MemoryPrimaryStore, TransactionalMutator};

/// Queue settings scaled down so tests settle in milliseconds.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        poll_interval: Duration::from_millis(10),
        orphan_after: Duration::from_secs(2),
        retry_base_delay: Duration::from_millis(20),
        retry_max_delay: Duration::from_millis(100),
        shutdown_timeout: Duration::from_secs(1),
        ..QueueConfig::default()
    }
}

/// Poll `check` until it yields true or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until no task in `queue` is waiting, running or due for a retry.
pub async fn queue_drained(queue: &dyn QueueBackend, limit: Duration) -> bool {
    wait_until(limit, move || async move {
        queue
            .stats()
            .await
            .is_ok_and(|stats| stats.iter().all(|entry| entry.outstanding() == 0))
    })
    .await
}

/// Per-queue counts with absent queues reported as empty.
pub async fn stats_for(queue: &dyn QueueBackend, name: &str) -> QueueStats {
    queue
        .stats()
        .await
        .expect("queue stats")
        .into_iter()
        .find(|entry| entry.queue == name)
        .unwrap_or_else(|| QueueStats::new(name))
}

/// Wait for `key` to disappear from `cache`.
pub async fn evicted(cache: &CacheStore, key: &CacheKey, limit: Duration) -> bool {
    let rendered = key.render();
    let rendered = rendered.as_str();
    wait_until(limit, move || async move {
        matches!(cache.get::<serde_json::Value>(rendered).await, Ok(None))
    })
    .await
}

/// Article service wired to in-memory engines plus a running processor.
pub struct Harness {
    pub service: ArticleService<MemoryPrimaryStore>,
    pub store: MemoryPrimaryStore,
    pub cache: CacheStore,
    pub queue: Arc<MemoryQueueBackend>,
    pub processor: Option<ProcessorHandle>,
}

impl Harness {
    pub fn new(run_processor: bool) -> Self {
        let store = MemoryPrimaryStore::new();
        let cache = CacheStore::memory();
        let queue = Arc::new(MemoryQueueBackend::new());
        let config = fast_queue_config();
        let cache_config = CacheConfig::default();

        let distributor = Distributor::new(queue.clone(), config.clone());
        let mutator = TransactionalMutator::new(store.clone(), Arc::new(distributor));
        let guard = IdempotencyGuard::new(
            cache.clone(),
            cache_config,
            Duration::from_secs(43_200),
        );
        let service = ArticleService::new(mutator, cache.clone(), cache_config, guard);

        let processor = run_processor.then(|| {
            Processor::new(
                queue.clone(),
                HandlerTable::with_cache_invalidation(cache.clone()),
                config,
            )
            .start()
            .expect("fresh processor starts")
        });

        Self {
            service,
            store,
            cache,
            queue,
            processor,
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.processor.take() {
            handle.shutdown().await;
        }
    }
}
