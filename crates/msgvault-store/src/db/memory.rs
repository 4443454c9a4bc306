//! In-memory store implementation for testing and simulation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use msgvault_model::{ConversationId, DocId, MsgDoc, MsgSlot, SlotUpdate};

use super::MsgDocDatabase;
use crate::{counter::SeqCounterStore, error::StoreError};

/// In-memory counter and document store.
///
/// All state is wrapped in `Arc<Mutex<_>>` so clones share the same
/// underlying storage and the struct stays Clone + Send + Sync. Lock
/// poisoning is ignored (the inner maps cannot be left half-updated by a
/// panicking reader).
#[derive(Clone, Default)]
pub struct MemoryStores {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Durable sequence counters, lazily created at 0.
    counters: HashMap<String, i64>,

    /// Retention floors.
    min_seqs: HashMap<String, i64>,

    /// Bucket documents keyed by doc ID.
    docs: HashMap<String, MsgDoc>,
}

impl MemoryStores {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored bucket documents, for tests and debugging.
    pub fn total_doc_count(&self) -> usize {
        self.lock().docs.len()
    }
}

#[async_trait]
impl SeqCounterStore for MemoryStores {
    async fn malloc(&self, conversation: &ConversationId, size: i64) -> Result<i64, StoreError> {
        if size < 0 {
            return Err(StoreError::InvalidCounter(format!("negative malloc size {size}")));
        }
        let mut inner = self.lock();
        let counter = inner.counters.entry(conversation.as_str().to_owned()).or_insert(0);
        let old = *counter;
        *counter += size;
        Ok(old)
    }

    async fn get_min(&self, conversation: &ConversationId) -> Result<i64, StoreError> {
        Ok(self.lock().min_seqs.get(conversation.as_str()).copied().unwrap_or(0))
    }

    async fn set_min(&self, conversation: &ConversationId, seq: i64) -> Result<(), StoreError> {
        self.lock().min_seqs.insert(conversation.as_str().to_owned(), seq);
        Ok(())
    }
}

#[async_trait]
impl MsgDocDatabase for MemoryStores {
    async fn create(&self, doc: &MsgDoc) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.docs.contains_key(doc.doc_id.as_str()) {
            return Err(StoreError::DuplicateDoc(doc.doc_id.to_string()));
        }
        inner.docs.insert(doc.doc_id.as_str().to_owned(), doc.clone());
        Ok(())
    }

    async fn update_slot(
        &self,
        doc_id: &DocId,
        index: usize,
        update: &SlotUpdate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(doc) = inner.docs.get_mut(doc_id.as_str()) else {
            return Ok(false);
        };
        let Some(slot) = doc.slots.get_mut(index) else {
            return Err(StoreError::Io(format!(
                "slot index {index} out of range for doc {doc_id}"
            )));
        };
        update.apply(slot);
        Ok(true)
    }

    async fn find_doc(&self, doc_id: &DocId) -> Result<Option<MsgDoc>, StoreError> {
        Ok(self.lock().docs.get(doc_id.as_str()).cloned())
    }

    async fn find_slots(
        &self,
        doc_id: &DocId,
        indexes: &[usize],
    ) -> Result<Option<Vec<MsgSlot>>, StoreError> {
        let inner = self.lock();
        let Some(doc) = inner.docs.get(doc_id.as_str()) else {
            return Ok(None);
        };
        Ok(Some(
            indexes.iter().map(|&i| doc.slots.get(i).cloned().unwrap_or_default()).collect(),
        ))
    }

    async fn doc_by_position(
        &self,
        conversation: &ConversationId,
        position: u64,
    ) -> Result<Option<MsgDoc>, StoreError> {
        let inner = self.lock();
        let mut buckets: Vec<&MsgDoc> = inner
            .docs
            .values()
            .filter(|doc| doc.doc_id.conversation().as_ref() == Some(conversation))
            .collect();
        buckets.sort_by_key(|doc| doc.doc_id.bucket().unwrap_or(i64::MAX));
        Ok(buckets.get(position as usize).map(|doc| (*doc).clone()))
    }

    async fn doc_count(&self, conversation: &ConversationId) -> Result<u64, StoreError> {
        let inner = self.lock();
        Ok(inner
            .docs
            .values()
            .filter(|doc| doc.doc_id.conversation().as_ref() == Some(conversation))
            .count() as u64)
    }

    async fn delete_doc(&self, doc_id: &DocId) -> Result<(), StoreError> {
        self.lock().docs.remove(doc_id.as_str());
        Ok(())
    }

    async fn delete_slots(&self, doc_id: &DocId, indexes: &[usize]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(doc) = inner.docs.get_mut(doc_id.as_str()) else {
            return Err(StoreError::NotFound(doc_id.to_string()));
        };
        for &index in indexes {
            if let Some(slot) = doc.slots.get_mut(index) {
                *slot = MsgSlot::default();
            }
        }
        Ok(())
    }
}
