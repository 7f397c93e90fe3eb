//! At-most-once guard for non-idempotent actions.

use std::time::Duration;

use metrics::counter;
use tracing::debug;

use crate::domain::keys::IdempotencyKey;

use super::config::CacheConfig;
use super::store::{CacheError, CacheStore};

const SOURCE: &str = "cache::idempotency";

/// Marks `(resource, actor, action)` identities as consumed for a window.
///
/// Acquisition is a single atomic set-if-absent, so concurrent attempts with
/// the same key have exactly one winner. Keys are never deleted on success;
/// the window ends when the entry expires.
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: CacheStore,
    config: CacheConfig,
    window: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: CacheStore, config: CacheConfig, window: Duration) -> Self {
        Self {
            store,
            config,
            window,
        }
    }

    /// Guard over `store` with the `[cache]` TTL policy and the
    /// `[idempotency]` window.
    pub fn from_settings(store: CacheStore, settings: &crate::config::Settings) -> Self {
        Self::new(
            store,
            CacheConfig::from(&settings.cache),
            settings.idempotency.window,
        )
    }

    /// Default dedup window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Try to claim `key` for `ttl`. A zero `ttl` uses the default window.
    ///
    /// Returns `true` for the first caller within the window and `false` for
    /// every later one. Store failures are returned as errors and never
    /// reported as "first".
    pub async fn acquire(&self, key: &IdempotencyKey, ttl: Duration) -> Result<bool, CacheError> {
        let ttl = self.config.resolve_ttl(ttl, self.window);
        let rendered = key.render();
        let acquired = self.store.set_nx(&rendered, &1_u8, ttl).await?;

        if !acquired {
            counter!(
                "scriptorium_idempotency_duplicate_total",
                "action" => key.action().as_str()
            )
            .increment(1);
            debug!(
                target = SOURCE,
                key = %rendered,
                guest = key.actor().is_guest(),
                "duplicate action suppressed"
            );
        }

        Ok(acquired)
    }

    /// Release a claim so the action can be attempted again.
    ///
    /// Used when the guarded action failed after the claim was taken.
    pub async fn release(&self, key: &IdempotencyKey) -> Result<(), CacheError> {
        self.store.delete(&key.render()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::domain::keys::{ActorIdentity, GuardedAction};

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(
            CacheStore::memory(),
            CacheConfig::default(),
            Duration::from_secs(12 * 60 * 60),
        )
    }

    fn like_key(actor: &str) -> IdempotencyKey {
        IdempotencyKey::article(
            Uuid::nil(),
            ActorIdentity::Subject(actor.to_string()),
            GuardedAction::Like,
        )
    }

    #[tokio::test]
    async fn second_acquire_within_window_is_rejected() {
        let guard = guard();
        let key = like_key("1");

        assert!(guard.acquire(&key, Duration::ZERO).await.unwrap());
        assert!(!guard.acquire(&key, Duration::ZERO).await.unwrap());
        assert!(guard.acquire(&like_key("2"), Duration::ZERO).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_succeeds_again_after_window() {
        let guard = guard();
        let key = like_key("1");

        assert!(guard.acquire(&key, Duration::from_secs(30)).await.unwrap());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(guard.acquire(&key, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn configured_window_bounds_default_claims() {
        let mut settings = crate::config::Settings::in_memory().unwrap();
        settings.idempotency.window = Duration::from_secs(90);
        let store = CacheStore::memory();
        let guard = IdempotencyGuard::from_settings(store.clone(), &settings);
        let key = like_key("1");

        assert_eq!(guard.window(), Duration::from_secs(90));
        assert!(guard.acquire(&key, Duration::ZERO).await.unwrap());
        assert_eq!(
            store.remaining_ttl(&key.render()).await.unwrap(),
            crate::cache::Remaining::Expires(Duration::from_secs(90))
        );

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(guard.acquire(&key, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn release_allows_retry() {
        let guard = guard();
        let key = like_key("1");

        assert!(guard.acquire(&key, Duration::ZERO).await.unwrap());
        guard.release(&key).await.unwrap();
        assert!(guard.acquire(&key, Duration::ZERO).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_has_single_winner() {
        let guard = Arc::new(guard());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                guard.acquire(&like_key("same"), Duration::ZERO).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            winners += usize::from(handle.await.unwrap());
        }
        assert_eq!(winners, 1);
    }
}
