//! Task handlers and the type-to-handler table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::CacheStore;

use super::task::{DeleteCacheKeysPayload, Delivery, TASK_DELETE_CACHE_KEYS};

const SOURCE: &str = "queue::handler";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for task type `{0}`")]
    Unregistered(String),
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Whether redelivering the same task cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Unregistered(_) | Self::Payload(_))
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Delivery) -> Result<(), HandlerError>;
}

/// Handlers keyed by task type.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the cache-key deletion handler registered.
    pub fn with_cache_invalidation(cache: CacheStore) -> Self {
        let mut table = Self::new();
        table.register(
            TASK_DELETE_CACHE_KEYS,
            Arc::new(DeleteCacheKeysHandler::new(cache)),
        );
        table
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// Deletes every key in a [`DeleteCacheKeysPayload`].
///
/// Keys are deleted one by one; if any deletion fails the attempt fails so
/// the whole batch is retried. Deleting an absent key counts as success.
pub struct DeleteCacheKeysHandler {
    cache: CacheStore,
}

impl DeleteCacheKeysHandler {
    pub fn new(cache: CacheStore) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl TaskHandler for DeleteCacheKeysHandler {
    async fn handle(&self, task: &Delivery) -> Result<(), HandlerError> {
        let payload: DeleteCacheKeysPayload = serde_json::from_value(task.payload.clone())?;

        let mut failed = 0_usize;
        let mut last_error = None;
        for key in &payload.keys {
            if let Err(err) = self.cache.delete(key).await {
                warn!(
                    target = SOURCE,
                    task_id = %task.id,
                    key = %key,
                    error = %err,
                    "failed to delete cache key"
                );
                failed += 1;
                last_error = Some(err);
            }
        }

        if let Some(err) = last_error {
            return Err(HandlerError::failed(format!(
                "failed to delete {failed} of {} keys: {err}",
                payload.keys.len()
            )));
        }

        debug!(
            target = SOURCE,
            task_id = %task.id,
            keys = payload.keys.len(),
            "cache keys deleted"
        );
        Ok(())
    }
}
