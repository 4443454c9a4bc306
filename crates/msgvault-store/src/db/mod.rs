//! Document database abstraction and its implementations.

mod memory;
mod redb;

use async_trait::async_trait;
use msgvault_model::{ConversationId, DocId, MsgDoc, MsgSlot, SlotUpdate};

pub use self::memory::MemoryStores;
pub use self::redb::RedbStores;
use crate::error::StoreError;

/// Bucketed message document database.
///
/// Buckets may race on creation between concurrent writers; this is
/// resolved by duplicate-key detection in [`create`](Self::create) rather
/// than pre-acquired locks.
#[async_trait]
pub trait MsgDocDatabase: Clone + Send + Sync + 'static {
    /// Insert a whole bucket document.
    ///
    /// Fails with [`StoreError::DuplicateDoc`] if a document with the same
    /// ID already exists (the expected creation race).
    async fn create(&self, doc: &MsgDoc) -> Result<(), StoreError>;

    /// Apply a typed partial update to one slot in place.
    ///
    /// Returns whether a document matched. A `false` return means the
    /// bucket does not exist yet and the caller should create it.
    async fn update_slot(
        &self,
        doc_id: &DocId,
        index: usize,
        update: &SlotUpdate,
    ) -> Result<bool, StoreError>;

    /// Load a whole bucket. `None` if it does not exist.
    async fn find_doc(&self, doc_id: &DocId) -> Result<Option<MsgDoc>, StoreError>;

    /// Extract the requested slots of a bucket.
    ///
    /// Returns `None` if the bucket does not exist; out-of-range indexes
    /// come back as empty slots.
    async fn find_slots(
        &self,
        doc_id: &DocId,
        indexes: &[usize],
    ) -> Result<Option<Vec<MsgSlot>>, StoreError>;

    /// The conversation's `position`-th bucket in ascending bucket order.
    ///
    /// Used by retention and newest/oldest scans. `None` when the
    /// conversation has fewer buckets.
    async fn doc_by_position(
        &self,
        conversation: &ConversationId,
        position: u64,
    ) -> Result<Option<MsgDoc>, StoreError>;

    /// Number of buckets stored for a conversation.
    async fn doc_count(&self, conversation: &ConversationId) -> Result<u64, StoreError>;

    /// Delete a whole bucket.
    async fn delete_doc(&self, doc_id: &DocId) -> Result<(), StoreError>;

    /// Clear the given slots of a bucket back to empty placeholders.
    async fn delete_slots(&self, doc_id: &DocId, indexes: &[usize]) -> Result<(), StoreError>;
}
