//! Cache and idempotency key definitions.
//!
//! Every key this subsystem reads, writes or invalidates is built here so the
//! layout (`<prefix>:v<version>:<namespace>:<identifier>`) can only change in
//! one place. Bumping [`KEY_SCHEMA_VERSION`] orphans every previously written
//! entry; they then age out through their TTL.

use std::fmt;

use uuid::Uuid;

/// Version segment embedded in every rendered key.
pub const KEY_SCHEMA_VERSION: u32 = 1;

/// Keyspace an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheNamespace {
    /// Article looked up by its id.
    Article,
    /// Article looked up by its URL slug.
    ArticleSlug,
    /// Live session of an authenticated subject.
    Session,
}

impl CacheNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheNamespace::Article => "article",
            CacheNamespace::ArticleSlug => "article_slug",
            CacheNamespace::Session => "session",
        }
    }
}

/// Structured cache key: namespace plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: CacheNamespace,
    identifier: String,
}

impl CacheKey {
    pub fn new(namespace: CacheNamespace, identifier: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: identifier.into(),
        }
    }

    pub fn article(id: Uuid) -> Self {
        Self::new(CacheNamespace::Article, id.to_string())
    }

    pub fn article_slug(slug: &str) -> Self {
        Self::new(CacheNamespace::ArticleSlug, slug)
    }

    pub fn session(subject_id: &str) -> Self {
        Self::new(CacheNamespace::Session, subject_id)
    }

    pub fn namespace(&self) -> CacheNamespace {
        self.namespace
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Render the storage-level string form.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache:v{KEY_SCHEMA_VERSION}:{}:{}",
            self.namespace.as_str(),
            self.identifier
        )
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.render()
    }
}

impl From<&CacheKey> for String {
    fn from(key: &CacheKey) -> Self {
        key.render()
    }
}

/// Non-idempotent action guarded by an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardedAction {
    Like,
    View,
}

impl GuardedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardedAction::Like => "like",
            GuardedAction::View => "view",
        }
    }
}

/// Who performed an action, for idempotency purposes.
///
/// The guest form is derived from the network address and the client's
/// user-agent string. Both are caller-controlled, so a guest can defeat the
/// guard by varying them; this is accepted for anonymous counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActorIdentity {
    Subject(String),
    Guest {
        address: String,
        client_signature: String,
    },
}

impl ActorIdentity {
    /// Prefer the authenticated subject; fall back to address + signature.
    pub fn from_request(
        subject_id: Option<&str>,
        address: &str,
        client_signature: &str,
    ) -> Self {
        match subject_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => ActorIdentity::Subject(id.to_string()),
            None => ActorIdentity::Guest {
                address: address.to_string(),
                client_signature: client_signature.to_string(),
            },
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, ActorIdentity::Guest { .. })
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorIdentity::Subject(id) => write!(f, "uid:{id}"),
            ActorIdentity::Guest {
                address,
                client_signature,
            } => write!(f, "guest:{address}:{client_signature}"),
        }
    }
}

/// Composite `(resource, actor, action)` identity of a guarded action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    resource: String,
    actor: ActorIdentity,
    action: GuardedAction,
}

impl IdempotencyKey {
    pub fn new(resource: impl Into<String>, actor: ActorIdentity, action: GuardedAction) -> Self {
        Self {
            resource: resource.into(),
            actor,
            action,
        }
    }

    pub fn article(article_id: Uuid, actor: ActorIdentity, action: GuardedAction) -> Self {
        Self::new(format!("article:{article_id}"), actor, action)
    }

    pub fn actor(&self) -> &ActorIdentity {
        &self.actor
    }

    pub fn action(&self) -> GuardedAction {
        self.action
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "idempotency:v{KEY_SCHEMA_VERSION}:{}:{}:{}",
            self.action.as_str(),
            self.resource,
            self.actor
        )
    }
}
