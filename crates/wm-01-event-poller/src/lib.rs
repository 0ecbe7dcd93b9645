//! # Event Poller Subsystem
//!
//! A single-writer loop that drives a handler over a locally-sequenced
//! collection: load the committed offset, query the next page, hand it to the
//! handler, commit the offset to the highest sequence consumed. Between pages
//! it sleeps until a shoulder-tap, a rewind, or the poll timeout.
//!
//! Both the aggregator (over pins) and every subscription dispatcher (over
//! events) are instances of this loop with different handlers.
//!
//! ## Invariants
//!
//! - At most one in-flight handler call per poller.
//! - The committed offset never decreases; rewinds move only the in-memory
//!   polling position until re-consumption succeeds.
//! - Every item at or below the committed offset has been delivered to the
//!   handler at least once.

pub mod config;
pub mod poller;
pub mod retry;
pub mod tap;

pub use config::EventPollerConf;
pub use poller::{EventPoller, OffsetCommitter, PollHandlers};
pub use retry::Retry;
pub use tap::ShoulderTap;
