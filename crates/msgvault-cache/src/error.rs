//! Cache-layer error types.

use msgvault_store::StoreError;
use thiserror::Error;

/// Errors from the cache primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not cached. Callers fall through to the source of truth.
    #[error("cache miss")]
    Miss,

    /// A per-key lock is held by another worker.
    #[error("lock held: {0}")]
    LockHeld(String),

    /// The cache backend failed. May be transient.
    #[error("cache I/O error: {0}")]
    Io(String),

    /// A cached value could not be decoded, or a value could not be
    /// encoded for caching.
    #[error("cache serialization error: {0}")]
    Serialization(String),
}

/// Errors from sequence allocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Every attempt found the allocation window locked by other workers.
    /// Transient; callers may retry.
    #[error("sequence allocation timed out waiting for the window lock")]
    AllocationTimeout,

    /// Negative allocation size. Programming error, not retried.
    #[error("invalid allocation size: {0}")]
    InvalidSize(i64),

    /// The durable counter failed; allocation cannot proceed without it.
    #[error(transparent)]
    Counter(#[from] StoreError),

    /// The cache backend failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}
