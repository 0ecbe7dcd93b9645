//! Domain layer: filter compilation and matching.

pub mod filter;
