//! Error types for the datastore engine.

use slipstream_core::EntryError;
use thiserror::Error;

/// Result type alias for datastore operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by datastore operations.
///
/// Per-record corruption (malformed stored JSON for a server entry, the
/// ranked vector, or a stat key) is never surfaced: read paths report an
/// alert notice, skip the record, and continue.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another handle holds the datastore file.
    #[error("datastore already open")]
    AlreadyOpen,

    /// The store was used after close (or was never opened).
    #[error("datastore not open")]
    Closed,

    /// Opening failed permanently; the datastore file has been deleted.
    #[error("failed to open datastore: {0}")]
    OpenFailed(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    /// Validation or decoding rejected a server entry.
    #[error(transparent)]
    InvalidEntry(#[from] EntryError),

    /// A persistent stat type outside the registered set.
    #[error("unknown persistent stat type: {0}")]
    UnknownStatType(String),
}

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StoreError::$variant(e.to_string())
    };
}

pub(crate) use map_err;
