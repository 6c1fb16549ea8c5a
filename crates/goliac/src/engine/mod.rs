//! The reconciliation engine: generic diffing, the batching executor,
//! and the phase-ordered reconciliator.

pub(crate) mod compare;
pub(crate) mod desired;
pub(crate) mod executor;
pub(crate) mod reconciliator;
