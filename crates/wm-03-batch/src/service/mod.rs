//! Service layer: processors, manager, sealing and dispatch.

pub mod broadcast_dispatch;
pub mod manager;
pub mod pin_submitter;
pub mod private_dispatch;
pub mod processor;
pub mod tx_helper;
