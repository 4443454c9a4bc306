//! Caching layer for the msgvault core.
//!
//! Four pieces build on each other:
//!
//! - [`KvCache`] and [`process_keys_by_slot`]: the hash-slot batch
//!   primitive, cluster-safe batched get/set/delete plus tombstoning and
//!   per-key locks.
//! - [`ReadThroughCache`]: compute-once-under-lock read-through caching
//!   with tombstone invalidation.
//! - [`SeqAllocator`]: the cached sequence-allocation window over a
//!   durable [`SeqCounterStore`](msgvault_store::SeqCounterStore).
//! - [`MessageCache`]: advisory per-message cache in front of the
//!   document store.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod alloc;
mod error;
mod msg_cache;
mod read_through;
mod slots;

pub use alloc::{
    AllocConfig, CommitOutcome, Headroom, MallocStep, SeqAllocator, SeqWindowCache,
};
pub use error::{AllocError, CacheError};
pub use msg_cache::MessageCache;
pub use read_through::{ConsistencyPolicy, ReadThroughCache};
pub use slots::{
    BatchPolicy, CacheValue, KvCache, MemoryKv, delete_cache_by_slot, process_keys_by_slot,
};
