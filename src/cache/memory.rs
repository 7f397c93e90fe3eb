//! Process-local cache engine.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::store::{CacheBackend, CacheError, Remaining};

#[derive(Debug)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    /// A deadline past the clock's range never arrives, so it is stored as
    /// no deadline at all.
    fn new(value: Vec<u8>, ttl: Duration, now: Instant) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            now.checked_add(ttl)
        };
        Self { value, expires_at }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// [`CacheBackend`] over a sharded concurrent map.
///
/// Expiry is lazy: expired entries are dropped when touched or by
/// [`purge_expired`](CacheBackend::purge_expired).
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: DashMap<String, StoredEntry>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        // The shard guard must be released before evicting.
        let lookup = self
            .entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.evict_if_expired(key, now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), StoredEntry::new(value, ttl, Instant::now()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(StoredEntry::new(value, ttl, now));
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredEntry::new(value, ttl, now));
                Ok(true)
            }
        }
    }

    async fn replace(
        &self,
        key: &str,
        expected: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if !entry.is_live(now) || entry.value != expected {
            return Ok(false);
        }
        entry.value = value;
        Ok(true)
    }

    async fn remaining(&self, key: &str) -> Result<Remaining, CacheError> {
        let now = Instant::now();
        let remaining = match self.entries.get(key) {
            None => Remaining::Missing,
            Some(entry) => match entry.expires_at {
                None => Remaining::Persistent,
                Some(deadline) if deadline > now => Remaining::Expires(deadline - now),
                Some(_) => Remaining::Missing,
            },
        };
        Ok(remaining)
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
