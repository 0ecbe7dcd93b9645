//! # Integration Tests
//!
//! End-to-end scenarios over a full in-memory node: outbound assembly and
//! dispatch looped back through the mock connectors into the aggregation
//! pipeline, down to application events and subscription delivery.

pub mod harness;

#[cfg(test)]
mod scenarios;
