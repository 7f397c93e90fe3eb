//! Session liveness cache.
//!
//! A self-contained token stays cryptographically valid until it expires, so
//! the cached record is the revocation switch: a token is only accepted while
//! its subject's record is present and not blocked.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::domain::keys::CacheKey;

use super::config::CacheConfig;
use super::store::{CacheError, CacheStore};

const SOURCE: &str = "cache::session";

/// Server-side state of an authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub subject_id: String,
    /// Claims the token was issued with.
    pub claims: serde_json::Value,
    pub refresh_token: Option<String>,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub blocked: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl SessionRecord {
    pub fn new(subject_id: impl Into<String>, claims: serde_json::Value) -> Self {
        Self {
            subject_id: subject_id.into(),
            claims,
            refresh_token: None,
            user_agent: None,
            client_ip: None,
            blocked: false,
            issued_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_client(mut self, user_agent: impl Into<String>, client_ip: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self.client_ip = Some(client_ip.into());
        self
    }
}

/// Outcome of validating a renewal attempt against the cached record.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Active(SessionRecord),
    /// No record: logged out, never issued, or expired.
    Missing,
    Blocked,
    /// The record belongs to a different subject.
    SubjectMismatch,
    /// The presented refresh token differs from the stored one.
    TokenMismatch,
}

#[derive(Debug, Clone)]
pub struct SessionCache {
    store: CacheStore,
    config: CacheConfig,
    default_ttl: Duration,
}

impl SessionCache {
    pub fn new(store: CacheStore, config: CacheConfig, default_ttl: Duration) -> Self {
        Self {
            store,
            config,
            default_ttl,
        }
    }

    /// Session cache over `store` using the `[session]` lifetime.
    pub fn from_settings(store: CacheStore, settings: &crate::config::Settings) -> Self {
        Self::new(store, CacheConfig::from(&settings.cache), settings.session.ttl)
    }

    /// Store `record` for `subject_id`. A zero `ttl` uses the session default.
    pub async fn put(
        &self,
        subject_id: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let ttl = self.config.resolve_ttl(ttl, self.default_ttl);
        self.store
            .set(&CacheKey::session(subject_id).render(), record, ttl)
            .await
    }

    pub async fn get(&self, subject_id: &str) -> Result<Option<SessionRecord>, CacheError> {
        self.store.get(&CacheKey::session(subject_id).render()).await
    }

    /// True iff a record is present for `subject_id` and it is not blocked.
    ///
    /// Independent of the token's own expiry claim.
    pub async fn is_valid(&self, subject_id: &str) -> Result<bool, CacheError> {
        Ok(self
            .get(subject_id)
            .await?
            .is_some_and(|record| !record.blocked))
    }

    /// Remove the record; every token for the subject stops validating.
    pub async fn invalidate(&self, subject_id: &str) -> Result<(), CacheError> {
        self.store
            .delete(&CacheKey::session(subject_id).render())
            .await?;
        info!(target = SOURCE, subject_id, "session invalidated");
        Ok(())
    }

    /// Mark the record blocked, keeping its remaining lifetime.
    ///
    /// The flag is written with a conditional swap, so a concurrent `put` or
    /// `invalidate` is never overwritten by a stale copy. Returns `false` when
    /// there was no record to block.
    pub async fn block(&self, subject_id: &str) -> Result<bool, CacheError> {
        let key = CacheKey::session(subject_id).render();
        let blocked = self
            .store
            .update(&key, |mut record: SessionRecord| {
                record.blocked = true;
                record
            })
            .await?;

        if blocked.is_none() {
            return Ok(false);
        }
        info!(target = SOURCE, subject_id, "session blocked");
        Ok(true)
    }

    /// Validate a renewal attempt.
    ///
    /// Checks run in order: presence, block flag, owning subject, then the
    /// refresh token when one is presented.
    pub async fn check(
        &self,
        subject_id: &str,
        refresh_token: Option<&str>,
    ) -> Result<SessionStatus, CacheError> {
        let Some(record) = self.get(subject_id).await? else {
            return Ok(SessionStatus::Missing);
        };

        if record.blocked {
            return Ok(SessionStatus::Blocked);
        }
        if record.subject_id != subject_id {
            return Ok(SessionStatus::SubjectMismatch);
        }
        if let Some(presented) = refresh_token
            && record.refresh_token.as_deref() != Some(presented)
        {
            return Ok(SessionStatus::TokenMismatch);
        }

        Ok(SessionStatus::Active(record))
    }
}
