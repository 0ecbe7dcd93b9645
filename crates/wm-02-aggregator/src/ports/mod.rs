//! Ports layer: outbound dependencies of the aggregation service.

pub mod outbound;
