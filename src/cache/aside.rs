//! Cache-aside read path.

use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::domain::keys::CacheKey;

use super::config::CacheConfig;
use super::store::CacheStore;

const SOURCE: &str = "cache::aside";

/// Return the cached value for `key`, loading and populating on miss.
///
/// Cache faults never fail the read: the value is loaded from `load` and the
/// fault is logged. Absent values (`Ok(None)`) are not cached. Entries are
/// written with the cache-wide default TTL so every populated key expires.
pub async fn read_through<T, E, F, Fut>(
    cache: &CacheStore,
    config: &CacheConfig,
    key: &CacheKey,
    load: F,
) -> Result<Option<T>, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let rendered = key.render();

    match cache.get::<T>(&rendered).await {
        Ok(Some(value)) => return Ok(Some(value)),
        Ok(None) => {
            debug!(target = SOURCE, key = %rendered, "cache miss");
        }
        Err(err) => {
            warn!(
                target = SOURCE,
                key = %rendered,
                error = %err,
                "cache read failed; falling back to primary store"
            );
        }
    }

    let loaded = load().await?;

    if let Some(value) = loaded.as_ref() {
        let ttl = config.entry_ttl(config.default_ttl);
        if let Err(err) = cache.set(&rendered, value, ttl).await {
            warn!(
                target = SOURCE,
                key = %rendered,
                error = %err,
                "failed to populate cache entry"
            );
        }
    }

    Ok(loaded)
}
