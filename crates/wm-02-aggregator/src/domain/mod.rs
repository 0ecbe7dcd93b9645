//! Domain layer: the per-page accumulator and supporting caches.

pub mod batch_cache;
pub mod batch_state;
