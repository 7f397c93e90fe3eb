//! Key/value cache store.
//!
//! [`CacheBackend`] is the byte-level engine seam; [`CacheStore`] is the typed
//! front every subsystem talks to. Values cross the boundary as JSON, so any
//! `Serialize`/`DeserializeOwned` type can be cached without the engines
//! knowing about it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use super::memory::MemoryCacheBackend;

const SOURCE: &str = "cache::store";
const MAX_UPDATE_ATTEMPTS: usize = 8;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend `{backend}` failed during {op}: {message}")]
    Backend {
        backend: &'static str,
        op: &'static str,
        message: String,
    },
    #[error("failed to encode cache value for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode cache value for `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache entry `{key}` kept changing during update")]
    Contended { key: String },
}

impl CacheError {
    pub fn backend(backend: &'static str, op: &'static str, message: impl ToString) -> Self {
        Self::Backend {
            backend,
            op,
            message: message.to_string(),
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// Absent or already expired.
    Missing,
    /// Present without an expiry.
    Persistent,
    /// Present and expiring after the given duration.
    Expires(Duration),
}

/// Byte-level cache engine.
///
/// A TTL of zero stores the entry without expiry. Expired entries must never
/// be returned by `get`, and `set_nx` must treat them as absent.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Store only if the key is absent or expired; returns whether it was stored.
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, CacheError>;

    /// Overwrite a live entry only while it still holds `expected`, keeping
    /// its deadline. Returns whether the swap happened.
    async fn replace(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<bool, CacheError>;

    async fn remaining(&self, key: &str) -> Result<Remaining, CacheError>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Typed front over a shared [`CacheBackend`].
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Process-local store, used by tests and single-node deployments.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCacheBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let backend = self.backend.name();
        let Some(bytes) = self.backend.get(key).await? else {
            counter!("scriptorium_cache_miss_total", "backend" => backend).increment(1);
            return Ok(None);
        };

        let value = decode(key, &bytes)?;
        counter!("scriptorium_cache_hit_total", "backend" => backend).increment(1);
        Ok(Some(value))
    }

    /// Store `value` under `key`. A zero `ttl` stores without expiry.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = encode(key, value)?;
        self.backend.set(key, bytes, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(key).await
    }

    pub async fn set_nx<T>(&self, key: &str, value: &T, ttl: Duration) -> Result<bool, CacheError>
    where
        T: Serialize + ?Sized,
    {
        let bytes = encode(key, value)?;
        self.backend.set_nx(key, bytes, ttl).await
    }

    /// Read-modify-write of a live entry that keeps its remaining lifetime.
    ///
    /// The write only lands if the entry is unchanged since it was read; a
    /// concurrent writer makes the read start over. Returns the stored value,
    /// or `None` when the key is absent or expired.
    pub async fn update<T, F>(&self, key: &str, mut apply: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut(T) -> T + Send,
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.backend.get(key).await? else {
                return Ok(None);
            };
            let next = apply(decode(key, &current)?);
            let bytes = encode(key, &next)?;
            if self.backend.replace(key, current, bytes).await? {
                return Ok(Some(next));
            }
        }
        Err(CacheError::Contended {
            key: key.to_string(),
        })
    }

    /// True when the key has no positive remaining lifetime.
    ///
    /// Keys stored without expiry also report `true`, because their remaining
    /// lifetime is not positive. Use [`remaining_ttl`](Self::remaining_ttl)
    /// to tell the two apart.
    pub async fn is_expired(&self, key: &str) -> Result<bool, CacheError> {
        Ok(!matches!(
            self.backend.remaining(key).await?,
            Remaining::Expires(_)
        ))
    }

    pub async fn remaining_ttl(&self, key: &str) -> Result<Remaining, CacheError> {
        self.backend.remaining(key).await
    }

    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        self.backend.purge_expired().await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}

fn encode<T>(key: &str, value: &T) -> Result<Vec<u8>, CacheError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(value).map_err(|source| CacheError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T>(key: &str, bytes: &[u8]) -> Result<T, CacheError>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(bytes).map_err(|source| {
        warn!(
            target = SOURCE,
            key,
            error = %source,
            "cached value could not be decoded"
        );
        CacheError::Decode {
            key: key.to_string(),
            source,
        }
    })
}
