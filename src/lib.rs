//! Write/cache-consistency core for the scriptorium blog backend.
//!
//! Mutations commit through [`tx::TransactionalMutator`], which hands typed
//! post-commit effects to the durable [`queue`]; the queue's processor later
//! deletes the affected keys from the [`cache`]. Idempotent counters and
//! session liveness are thin policies over the same cache store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod queue;
pub mod tx;
pub(crate) mod util;
