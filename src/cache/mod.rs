//! Cache layer.
//!
//! - [`CacheStore`]: typed key/value store with per-entry TTL over a pluggable
//!   [`CacheBackend`] (in-process or Postgres).
//! - [`read_through`]: cache-aside reads that degrade to the primary store.
//! - [`IdempotencyGuard`]: at-most-once claims for counters.
//! - [`SessionCache`]: server-side liveness switch for issued tokens.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! backend = "postgres"
//! default_ttl_secs = 1800
//! max_ttl_secs = 604800
//! purge_interval_secs = 60
//! ```

mod aside;
mod config;
mod idempotency;
mod memory;
mod postgres;
mod session;
mod store;

pub use aside::read_through;
pub use config::CacheConfig;
pub use idempotency::IdempotencyGuard;
pub use memory::MemoryCacheBackend;
pub use postgres::PostgresCacheBackend;
pub use session::{SessionCache, SessionRecord, SessionStatus};
pub use store::{CacheBackend, CacheError, CacheStore, Remaining};
