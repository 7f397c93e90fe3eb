//! Background worker wiring: backend selection, the queue processor and the
//! maintenance loop that sweeps expired cache entries and samples queue depth.

use std::{future::Future, sync::Arc, time::Duration};

use metrics::{counter, gauge};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::{
    application::{articles::ArticleService, error::AppError},
    cache::{
        CacheConfig, CacheStore, IdempotencyGuard, MemoryCacheBackend, PostgresCacheBackend,
        SessionCache,
    },
    config::{Settings, StorageBackend},
    infra::{db::PostgresRepositories, error::InfraError},
    queue::{
        Distributor, HandlerTable, MemoryQueueBackend, PostgresQueueBackend, Processor,
        QueueBackend, QueueConfig, QueueStats, ShutdownReport,
    },
    tx::TransactionalMutator,
};

const SOURCE: &str = "infra::worker";

/// Storage engines selected by configuration.
#[derive(Clone)]
pub struct Backends {
    pub cache: CacheStore,
    pub queue: Arc<dyn QueueBackend>,
    /// Present whenever a database URL is configured.
    pub repositories: Option<PostgresRepositories>,
}

impl Backends {
    /// Process-local engines, used when nothing durable is configured.
    pub fn in_memory() -> Self {
        Self {
            cache: CacheStore::new(Arc::new(MemoryCacheBackend::new())),
            queue: Arc::new(MemoryQueueBackend::new()),
            repositories: None,
        }
    }

    /// Duplicate-action guard using the configured dedup window.
    pub fn idempotency(&self, settings: &Settings) -> IdempotencyGuard {
        IdempotencyGuard::from_settings(self.cache.clone(), settings)
    }

    /// Session cache using the configured session lifetime.
    pub fn sessions(&self, settings: &Settings) -> SessionCache {
        SessionCache::from_settings(self.cache.clone(), settings)
    }

    /// Article service over the Postgres primary store, enqueueing its
    /// invalidations on the configured queue.
    pub fn article_service(
        &self,
        settings: &Settings,
    ) -> Result<ArticleService<PostgresRepositories>, InfraError> {
        let repositories = self.repositories.clone().ok_or_else(|| {
            InfraError::configuration("the article service needs database.url")
        })?;
        let distributor = Distributor::new(
            Arc::clone(&self.queue),
            QueueConfig::from(&settings.queue),
        );

        Ok(ArticleService::new(
            TransactionalMutator::new(repositories, Arc::new(distributor)),
            self.cache.clone(),
            CacheConfig::from(&settings.cache),
            self.idempotency(settings),
        ))
    }
}

/// Refuse process-local engines for a process that shares work with others.
///
/// Invalidations enqueued by writers and entries cached by readers only reach
/// a worker through the database, so a worker on memory engines would never
/// see them.
pub fn require_shared_engines(settings: &Settings) -> Result<(), InfraError> {
    for (what, backend) in [
        ("cache", settings.cache.backend),
        ("queue", settings.queue.backend),
    ] {
        if matches!(backend, StorageBackend::Memory) {
            return Err(InfraError::configuration(format!(
                "{what}.backend = \"memory\" is process-local; the worker needs \"postgres\""
            )));
        }
    }
    Ok(())
}

/// Connect the engines chosen in `settings`, applying migrations first when a
/// database is configured.
pub async fn connect_backends(settings: &Settings) -> Result<Backends, InfraError> {
    let repositories = match settings.database.url {
        Some(_) => Some(PostgresRepositories::open(&settings.database).await?),
        None => None,
    };

    let database = |what: &'static str| {
        repositories.as_ref().ok_or_else(|| {
            InfraError::configuration(format!("{what} backend `postgres` needs database.url"))
        })
    };

    let cache = match settings.cache.backend {
        StorageBackend::Memory => CacheStore::new(Arc::new(MemoryCacheBackend::new())),
        StorageBackend::Postgres => {
            let repos = database("cache")?;
            CacheStore::new(Arc::new(PostgresCacheBackend::new(repos.pool().clone())))
        }
    };

    let queue: Arc<dyn QueueBackend> = match settings.queue.backend {
        StorageBackend::Memory => Arc::new(MemoryQueueBackend::new()),
        StorageBackend::Postgres => {
            let repos = database("queue")?;
            Arc::new(PostgresQueueBackend::new(repos.pool().clone()))
        }
    };

    info!(
        target = SOURCE,
        cache_backend = cache.backend_name(),
        queue_backend = queue.name(),
        database = repositories.is_some(),
        "backends connected"
    );

    Ok(Backends {
        cache,
        queue,
        repositories,
    })
}

/// Run the processor and maintenance loop until `shutdown` resolves, then
/// drain in-flight attempts within the configured shutdown timeout.
#[instrument(skip_all, fields(cache = backends.cache.backend_name(), queue = backends.queue.name()))]
pub async fn run_worker<F>(
    backends: &Backends,
    settings: &Settings,
    shutdown: F,
) -> Result<ShutdownReport, AppError>
where
    F: Future<Output = ()>,
{
    let queue_config = QueueConfig::from(&settings.queue);
    let handlers = HandlerTable::with_cache_invalidation(backends.cache.clone());
    let processor = Processor::new(Arc::clone(&backends.queue), handlers, queue_config);
    let handle = processor.start()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let maintenance = tokio::spawn(maintenance_loop(
        backends.cache.clone(),
        Arc::clone(&backends.queue),
        Duration::from_secs(u64::from(settings.cache.purge_interval_secs.get())),
        stop_rx,
    ));

    info!(
        target = SOURCE,
        queues = settings.queue.weights.len(),
        "worker running"
    );

    shutdown.await;
    info!(target = SOURCE, "shutdown requested");

    let _ = stop_tx.send(true);
    let report = handle.shutdown().await;
    if let Err(err) = maintenance.await {
        warn!(target = SOURCE, error = %err, "maintenance loop ended abnormally");
    }

    info!(
        target = SOURCE,
        drained = report.drained,
        abandoned = report.abandoned,
        "worker stopped"
    );
    Ok(report)
}

async fn maintenance_loop(
    cache: CacheStore,
    queue: Arc<dyn QueueBackend>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_expired(&cache).await;
                purge_completed(queue.as_ref()).await;
                sample_queue_depth(queue.as_ref()).await;
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

/// Remove expired cache entries, recording how many were dropped.
#[instrument(skip(cache), fields(backend = cache.backend_name()))]
pub async fn sweep_expired(cache: &CacheStore) -> u64 {
    match cache.purge_expired().await {
        Ok(purged) => {
            if purged > 0 {
                counter!("scriptorium_cache_purged_total", "backend" => cache.backend_name())
                    .increment(purged);
                debug!(target = SOURCE, purged, "expired cache entries purged");
            }
            purged
        }
        Err(err) => {
            warn!(target = SOURCE, error = %err, "cache purge failed");
            0
        }
    }
}

/// Forget tasks that completed successfully.
pub async fn purge_completed(queue: &dyn QueueBackend) -> u64 {
    match queue.purge_done().await {
        Ok(purged) => {
            if purged > 0 {
                counter!("scriptorium_queue_purged_total", "backend" => queue.name())
                    .increment(purged);
            }
            purged
        }
        Err(err) => {
            warn!(target = SOURCE, error = %err, "queue purge failed");
            0
        }
    }
}

async fn sample_queue_depth(queue: &dyn QueueBackend) {
    let stats = match queue.stats().await {
        Ok(stats) => stats,
        Err(err) => {
            warn!(target = SOURCE, error = %err, "queue stats unavailable");
            return;
        }
    };

    for QueueStats {
        queue,
        pending,
        scheduled,
        running,
        retrying,
        dead,
        done,
    } in stats
    {
        for (state, count) in [
            ("pending", pending),
            ("scheduled", scheduled),
            ("running", running),
            ("retrying", retrying),
            ("dead", dead),
            ("done", done),
        ] {
            gauge!("scriptorium_queue_depth", "queue" => queue.clone(), "state" => state)
                .set(count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::keys::CacheKey;

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let cache = CacheStore::memory();
        cache.set("short", &1u8, Duration::from_secs(1)).await.unwrap();
        cache.set("long", &2u8, Duration::from_secs(600)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(sweep_expired(&cache).await, 1);
        assert_eq!(cache.get::<u8>("long").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn worker_processes_invalidations_until_shutdown() {
        let mut settings = Settings::in_memory().unwrap();
        settings.queue.poll_interval = Duration::from_millis(10);
        settings.queue.shutdown_timeout = Duration::from_secs(1);

        let backends = Backends::in_memory();
        let key = CacheKey::article_slug("hello");
        let rendered = key.render();
        backends
            .cache
            .set(&rendered, &"cached", Duration::from_secs(600))
            .await
            .unwrap();

        let distributor =
            Distributor::new(Arc::clone(&backends.queue), QueueConfig::from(&settings.queue));
        distributor
            .enqueue_invalidation(std::slice::from_ref(&key))
            .await
            .unwrap();

        let cache = backends.cache.clone();
        let watched = rendered.clone();
        let shutdown = async move {
            for _ in 0..300 {
                if cache.get::<String>(&watched).await.unwrap().is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        let report = run_worker(&backends, &settings, shutdown).await.unwrap();

        assert_eq!(report.abandoned, 0);
        assert_eq!(backends.cache.get::<String>(&rendered).await.unwrap(), None);
        let stats = backends.queue.stats().await.unwrap();
        assert!(stats.iter().all(|s| s.outstanding() + s.dead == 0));
    }

    #[tokio::test]
    async fn completed_tasks_are_purged() {
        let queue = MemoryQueueBackend::new();
        assert_eq!(purge_completed(&queue).await, 0);
    }

    #[test]
    fn shared_processes_refuse_process_local_engines() {
        let settings = Settings::in_memory().unwrap();
        assert!(matches!(
            require_shared_engines(&settings),
            Err(InfraError::Configuration { .. })
        ));

        let mut settings = Settings::in_memory().unwrap();
        settings.cache.backend = StorageBackend::Postgres;
        assert!(require_shared_engines(&settings).is_err());

        settings.queue.backend = StorageBackend::Postgres;
        assert!(require_shared_engines(&settings).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn composed_guards_use_configured_lifetimes() {
        let mut settings = Settings::in_memory().unwrap();
        settings.idempotency.window = Duration::from_secs(90);
        settings.session.ttl = Duration::from_secs(300);
        let backends = Backends::in_memory();

        assert_eq!(backends.idempotency(&settings).window(), Duration::from_secs(90));

        let sessions = backends.sessions(&settings);
        let record = crate::cache::SessionRecord::new("7", serde_json::json!({ "sub": "7" }));
        sessions.put("7", &record, Duration::ZERO).await.unwrap();
        assert_eq!(
            backends
                .cache
                .remaining_ttl(&CacheKey::session("7").render())
                .await
                .unwrap(),
            crate::cache::Remaining::Expires(Duration::from_secs(300))
        );
    }

    #[test]
    fn article_service_needs_a_database() {
        let settings = Settings::in_memory().unwrap();
        assert!(matches!(
            Backends::in_memory().article_service(&settings),
            Err(InfraError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn postgres_backend_without_database_is_rejected() {
        let mut settings = Settings::in_memory().unwrap();
        settings.queue.backend = StorageBackend::Postgres;

        let err = match connect_backends(&settings).await {
            Ok(_) => panic!("expected configuration error"),
            Err(err) => err,
        };
        assert!(matches!(err, InfraError::Configuration { .. }));
    }
}
