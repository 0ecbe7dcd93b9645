//! # Node Runtime
//!
//! Constructs and wires the Weftmesh subsystems into a running node:
//!
//! ## Wiring phases
//!
//! 1. **Store & connectors** - supplied by the embedder (in-memory store and
//!    mock connectors for tests and development).
//! 2. **Aggregation** - data manager, definition handlers, aggregator, and
//!    the connector-facing event manager.
//! 3. **Outbound** - operation manager, pin submitter, broadcast and private
//!    dispatchers, batch manager.
//! 4. **Delivery** - subscription manager and transports.
//!
//! There are no process-wide singletons: the orchestrator owns every
//! subsystem and hands tasks their dependencies explicitly.

pub mod config;
pub mod orchestrator;

pub use config::NodeConfig;
pub use orchestrator::Orchestrator;
