//! Storage error types.

use thiserror::Error;

/// Errors from the persistent counter and document stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Caller supplied messages whose seqs are not contiguous from the
    /// declared first seq. Programming error, not retried.
    #[error("invalid sequence range: expected seq {expected}, got {got}")]
    InvalidSequenceRange {
        /// The seq the position implies.
        expected: i64,
        /// The seq the caller supplied.
        got: i64,
    },

    /// A bucket with this ID already exists. Expected race between
    /// concurrent creators; handled internally by block insert, never
    /// surfaced from it.
    #[error("bucket document already exists: {0}")]
    DuplicateDoc(String),

    /// Requested document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// Counter moved backwards or a reservation was invalid.
    #[error("invalid counter operation: {0}")]
    InvalidCounter(String),

    /// Underlying database I/O failed. May be transient.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Stored bytes could not be decoded, or a value could not be
    /// encoded. Fatal for the affected record.
    #[error("serialization error: {0}")]
    Serialization(String),
}
