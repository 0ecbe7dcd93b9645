//! Ports layer: the transport driven port.

pub mod transport;
