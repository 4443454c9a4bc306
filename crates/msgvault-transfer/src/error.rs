//! Transfer-pipeline error types.

use msgvault_cache::{AllocError, CacheError};
use msgvault_store::StoreError;
use thiserror::Error;

/// Errors from the transfer pipeline and its queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// A batch with no messages was submitted. Programming error.
    #[error("empty message batch")]
    EmptyBatch,

    /// Sequence allocation failed.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The cache layer failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A queue send or commit failed; the peer is gone or backed up.
    #[error("transport error: {0}")]
    Transport(String),

    /// A queue event could not be encoded before publishing.
    #[error("event encode error: {0}")]
    Encode(String),

    /// A queue payload could not be decoded. The event is dropped after
    /// logging; there is nothing to retry.
    #[error("event decode error: {0}")]
    Decode(String),
}
