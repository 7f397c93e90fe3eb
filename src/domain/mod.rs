//! Domain layer types and invariants.

pub mod entities;
pub mod keys;
pub mod types;
