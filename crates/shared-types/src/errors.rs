//! # Error Taxonomy
//!
//! Every failure in the node falls into one of three classes, and the class
//! alone decides how callers react:
//!
//! - `Transient`: store or connector I/O problems. Retried with backoff until
//!   the owning task is cancelled; poller offsets do not advance.
//! - `Invalid`: malformed or unresolvable input (bad pin string, mismatched
//!   batch hash, unknown signer). Logged with identifiers and skipped; the
//!   stream advances because no retry can repair the input.
//! - `Fatal`: cancellation and programmer errors. Propagated upward; the
//!   enclosing task exits.

use thiserror::Error;

/// Failure class consumed by the retrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Unrecoverable without new input; skip and advance.
    Invalid,
    /// Unwinds the enclosing task.
    Fatal,
}

/// Implemented by every error enum in the workspace so the retry loops can
/// act on class rather than concrete type.
pub trait Classified {
    /// The failure class of this error value.
    fn class(&self) -> ErrorClass;

    /// True if the retrier should act on this error.
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Errors from parsing wire-level values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Not a 64-character hex string.
    #[error("Invalid 32-byte hash: '{0}'")]
    InvalidHash(String),

    /// A masked pin string that is not `HASH` or `HASH:NONCE`.
    #[error("Invalid masked pin: '{0}'")]
    InvalidPin(String),

    /// A manifest whose version tag is not understood.
    #[error("Invalid manifest version: {0}")]
    InvalidManifestVersion(u32),

    /// Serialization round-trip failure.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl Classified for ParseError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Invalid
    }
}
