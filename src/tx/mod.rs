//! Transactional mutation with post-commit effects.
//!
//! Effects registered while a transaction is open are held back until the
//! primary store reports a successful commit. A rolled-back or failed
//! transaction discards them, so an invalidation is never enqueued for a
//! write that did not happen. Dispatch happens strictly after commit and a
//! dispatch failure never turns a committed write into an error.

mod memory;
mod postgres;

pub use memory::{MemoryPrimaryStore, MemoryTx};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use metrics::counter;
use thiserror::Error;
use tracing::{error, warn};

use crate::application::repos::RepoError;
use crate::domain::keys::CacheKey;
use crate::queue::QueueError;

const SOURCE: &str = "tx";

/// Side effect to run once the surrounding transaction has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Enqueue deletion of the given cache keys.
    InvalidateKeys { keys: Vec<CacheKey> },
}

impl Effect {
    fn kind(&self) -> &'static str {
        match self {
            Effect::InvalidateKeys { .. } => "invalidate_keys",
        }
    }
}

/// Destination of committed effects.
#[async_trait]
pub trait EffectSink: Send + Sync {
    async fn dispatch(&self, effect: &Effect) -> Result<(), QueueError>;
}

/// Primary store able to open, commit and roll back transactions.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, RepoError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), RepoError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), RepoError>;
}

/// Failure of the transaction machinery itself, as opposed to the caller's work.
#[derive(Debug, Error)]
pub enum CommitFailure {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] RepoError),
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] RepoError),
}

/// Open transaction plus the effects registered against it.
pub struct TxScope<Tx> {
    tx: Tx,
    effects: Vec<Effect>,
}

impl<Tx> TxScope<Tx> {
    fn new(tx: Tx) -> Self {
        Self {
            tx,
            effects: Vec::new(),
        }
    }

    pub fn tx(&mut self) -> &mut Tx {
        &mut self.tx
    }

    /// Register an effect to run after a successful commit.
    pub fn after_commit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Register invalidation of `keys`. An empty set registers nothing.
    pub fn invalidate(&mut self, keys: impl IntoIterator<Item = CacheKey>) {
        let mut keys: Vec<CacheKey> = keys.into_iter().collect();
        if keys.is_empty() {
            return;
        }
        let mut seen = std::collections::HashSet::new();
        keys.retain(|key| seen.insert(key.clone()));
        self.after_commit(Effect::InvalidateKeys { keys });
    }

    pub fn pending_effects(&self) -> &[Effect] {
        &self.effects
    }
}

/// How post-commit dispatch went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectReport {
    pub dispatched: usize,
    pub failed: usize,
}

impl EffectReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Runs caller work inside a transaction and dispatches effects after commit.
pub struct TransactionalMutator<S> {
    store: S,
    sink: Arc<dyn EffectSink>,
}

impl<S> TransactionalMutator<S>
where
    S: PrimaryStore,
{
    pub fn new(store: S, sink: Arc<dyn EffectSink>) -> Self {
        Self { store, sink }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `work` in a transaction.
    ///
    /// On `Ok` the transaction is committed and registered effects are
    /// dispatched in registration order. On `Err` the transaction is rolled
    /// back, effects are discarded and the error is returned unchanged.
    pub async fn execute<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut TxScope<S::Tx>) -> BoxFuture<'c, Result<T, E>>,
        E: From<CommitFailure>,
    {
        self.execute_reported(work).await.map(|(value, _)| value)
    }

    /// [`execute`](Self::execute), also reporting how dispatch went.
    pub async fn execute_reported<T, E, F>(&self, work: F) -> Result<(T, EffectReport), E>
    where
        F: for<'c> FnOnce(&'c mut TxScope<S::Tx>) -> BoxFuture<'c, Result<T, E>>,
        E: From<CommitFailure>,
    {
        let tx = self
            .store
            .begin()
            .await
            .map_err(|err| E::from(CommitFailure::Begin(err)))?;

        let mut scope = TxScope::new(tx);
        let outcome = work(&mut scope).await;
        let TxScope { tx, effects } = scope;

        let value = match outcome {
            Ok(value) => value,
            Err(err) => {
                counter!("scriptorium_tx_rolled_back_total").increment(1);
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    warn!(
                        target = SOURCE,
                        error = %rollback_err,
                        discarded_effects = effects.len(),
                        "rollback failed after work error"
                    );
                }
                return Err(err);
            }
        };

        if let Err(err) = self.store.commit(tx).await {
            counter!("scriptorium_tx_commit_failed_total").increment(1);
            warn!(
                target = SOURCE,
                error = %err,
                discarded_effects = effects.len(),
                "commit failed; effects discarded"
            );
            return Err(E::from(CommitFailure::Commit(err)));
        }

        let report = self.dispatch(effects).await;
        Ok((value, report))
    }

    async fn dispatch(&self, effects: Vec<Effect>) -> EffectReport {
        let mut report = EffectReport::default();
        for effect in effects {
            match self.sink.dispatch(&effect).await {
                Ok(()) => {
                    counter!("scriptorium_effect_dispatched_total", "kind" => effect.kind())
                        .increment(1);
                    report.dispatched += 1;
                }
                Err(err) => {
                    // The write is committed; the stale entry ages out via its TTL.
                    counter!("scriptorium_effect_dispatch_failed_total", "kind" => effect.kind())
                        .increment(1);
                    error!(
                        target = SOURCE,
                        kind = effect.kind(),
                        effect = ?effect,
                        error = %err,
                        "post-commit effect dispatch failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::application::repos::ArticleWrites;
    use crate::domain::types::ArticleCounter;

    #[derive(Default)]
    struct RecordingSink {
        effects: Mutex<Vec<Effect>>,
        fail: bool,
    }

    #[async_trait]
    impl EffectSink for RecordingSink {
        async fn dispatch(&self, effect: &Effect) -> Result<(), QueueError> {
            if self.fail {
                return Err(QueueError::backend("test", "push", "unavailable"));
            }
            self.effects.lock().unwrap().push(effect.clone());
            Ok(())
        }
    }

    #[derive(Debug, Error)]
    enum TestError {
        #[error("work failed")]
        Work,
        #[error(transparent)]
        Commit(#[from] CommitFailure),
        #[error(transparent)]
        Repo(#[from] RepoError),
    }

    fn mutator(sink: Arc<RecordingSink>) -> TransactionalMutator<MemoryPrimaryStore> {
        TransactionalMutator::new(MemoryPrimaryStore::new(), sink)
    }

    #[tokio::test]
    async fn effects_dispatch_only_after_commit() {
        let sink = Arc::new(RecordingSink::default());
        let mutator = mutator(sink.clone());
        let key = CacheKey::article(Uuid::nil());

        let pending = mutator
            .execute(|scope| {
                let key = key.clone();
                Box::pin(async move {
                    scope.invalidate([key.clone(), key]);
                    Ok::<_, TestError>(scope.pending_effects().len())
                })
            })
            .await
            .unwrap();

        assert_eq!(pending, 1);
        assert_eq!(
            *sink.effects.lock().unwrap(),
            vec![Effect::InvalidateKeys { keys: vec![key] }]
        );
    }

    #[tokio::test]
    async fn failed_work_discards_effects_and_rolls_back() {
        let sink = Arc::new(RecordingSink::default());
        let mutator = mutator(sink.clone());
        let id = Uuid::new_v4();

        let err = mutator
            .execute(|scope| {
                Box::pin(async move {
                    scope
                        .tx()
                        .increment_counter(id, ArticleCounter::Likes)
                        .await?;
                    scope.invalidate([CacheKey::article(id)]);
                    Err::<(), _>(TestError::Work)
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TestError::Work));
        assert!(sink.effects.lock().unwrap().is_empty());
        assert_eq!(mutator.store().commits(), 0);
    }

    #[tokio::test]
    async fn commit_failure_discards_effects() {
        let sink = Arc::new(RecordingSink::default());
        let mutator = mutator(sink.clone());
        mutator.store().fail_next_commit();

        let err = mutator
            .execute(|scope| {
                Box::pin(async move {
                    scope.invalidate([CacheKey::session("1")]);
                    Ok::<_, TestError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TestError::Commit(CommitFailure::Commit(_))));
        assert!(sink.effects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_keeps_committed_result() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let mutator = mutator(sink);

        let (value, report) = mutator
            .execute_reported(|scope| {
                Box::pin(async move {
                    scope.invalidate([CacheKey::session("1")]);
                    scope.invalidate([CacheKey::session("2")]);
                    Ok::<_, TestError>(7)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(
            report,
            EffectReport {
                dispatched: 0,
                failed: 2
            }
        );
        assert_eq!(mutator.store().commits(), 1);
    }

    #[tokio::test]
    async fn empty_invalidation_registers_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mutator = mutator(sink.clone());

        let (_, report) = mutator
            .execute_reported(|scope| {
                Box::pin(async move {
                    scope.invalidate(Vec::new());
                    Ok::<_, TestError>(())
                })
            })
            .await
            .unwrap();

        assert_eq!(report, EffectReport::default());
        assert!(sink.effects.lock().unwrap().is_empty());
    }
}
