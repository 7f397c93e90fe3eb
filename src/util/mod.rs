//! Small crate-internal helpers.

pub(crate) mod lock;
