//! # Error
//!
//! Crate-wide error type. Each variant corresponds to one of the error kinds
//! catalogued for the store: callers are expected to match on these, not on
//! string content.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the store, index, and query layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on a store that has not been opened (or has been
    /// closed).
    #[error("store is not open")]
    NotOpen,

    /// Operation aborted because its cancellation token was signalled.
    #[error("operation cancelled")]
    Cancelled,

    /// An index property name or value could not be stored: empty or `\0`
    /// containing property name, non-finite number, or an encoded value
    /// larger than the implementation's maximum.
    #[error("bad index value: {0}")]
    BadIndexValue(String),

    /// A filter was malformed: both `gt` and `gte` (or `lt` and `lte`) set,
    /// a range with neither side set, an empty filter inside a multi-filter
    /// query, or an empty query.
    #[error("bad filter: {0}")]
    BadFilter(String),

    /// The underlying substrate returned data inconsistent with the store's
    /// invariants (e.g. a secondary key pointing at a missing indexes
    /// record). Surfaced to the caller; does not poison the store.
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// A substrate-level failure: disk full, permission denied, and the
    /// like. Propagated verbatim.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A failure from the `sled` storage engine.
    #[error("storage engine: {0}")]
    Sled(#[from] sled::Error),

    /// A failure decoding or encoding a stored value.
    #[error("(de)serialization: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}
