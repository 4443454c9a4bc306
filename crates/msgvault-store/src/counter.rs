//! The durable per-conversation sequence counter.

use async_trait::async_trait;
use msgvault_model::ConversationId;

use crate::error::StoreError;

/// Durable monotonic counter, one per conversation.
///
/// The counter is the source of truth for sequence assignment: the cached
/// allocation window is always re-derived from it, and correctness defers
/// to it whenever the two disagree.
///
/// Must be Clone (shared by allocator and retention), Send + Sync.
/// Implementations typically share internal state via Arc, so clones
/// access the same underlying store.
#[async_trait]
pub trait SeqCounterStore: Clone + Send + Sync + 'static {
    /// Atomically reserve `size` contiguous seqs and return the first.
    ///
    /// Reserves `[old, old + size)` where `old` is the counter value
    /// before the call. `size == 0` reads the current value without
    /// reserving. The counter never decreases; it is lazily created at 0
    /// on first access.
    async fn malloc(&self, conversation: &ConversationId, size: i64) -> Result<i64, StoreError>;

    /// Current counter value: the lowest seq never reserved.
    async fn get_max(&self, conversation: &ConversationId) -> Result<i64, StoreError> {
        self.malloc(conversation, 0).await
    }

    /// Retention floor: seqs below this are considered purged.
    async fn get_min(&self, conversation: &ConversationId) -> Result<i64, StoreError>;

    /// Set the retention floor.
    async fn set_min(&self, conversation: &ConversationId, seq: i64) -> Result<(), StoreError>;
}
