//! # Shared Connectors Crate
//!
//! Driven ports for the three external runtimes the node talks to:
//!
//! - `blockchain` - anchoring pins and contract interaction on the ledger
//! - `dataexchange` - private blob and batch transfer between nodes
//! - `tokens` - token pool and transfer management
//!
//! Each module pairs the connector trait with the callback trait the node
//! registers for asynchronous receipts, plus a mock adapter that records
//! calls for tests. Connectors are looked up by name from a registry built at
//! wiring time; nothing in the core names a concrete connector type.

pub mod blockchain;
pub mod dataexchange;
pub mod error;
pub mod tokens;

pub use blockchain::{
    BlockchainCallbacks, BlockchainConnector, MockBlockchainConnector, SubmittedBatchPin,
};
pub use dataexchange::{
    DataExchangeCallbacks, DataExchangeConnector, MockDataExchangeConnector, SentItem,
    TransferStatus,
};
pub use error::ConnectorError;
pub use tokens::{MockTokenConnector, TokenCallbacks, TokenConnector, TokenPoolAnnouncement};
