//! Redb-backed durable store implementation.
//!
//! Uses redb's ACID transactions with copy-on-write for crash safety. All
//! state survives process restarts. The single-writer transaction model
//! makes the counter's reserve-and-return-old operation atomic without
//! extra locking.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use msgvault_model::{ConversationId, DocId, MsgDoc, MsgSlot, SlotUpdate};
use redb::{Database, ReadableTable, TableDefinition};

use super::MsgDocDatabase;
use crate::{counter::SeqCounterStore, error::StoreError};

/// Table: bucket documents
/// Key: conversation bytes + 0x00 + bucket ordinal (8 bytes BE)
/// Value: CBOR-encoded `MsgDoc`
const DOCS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("docs");

/// Table: durable sequence counters, keyed by conversation ID.
const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("seq_counters");

/// Table: retention floors, keyed by conversation ID.
const MIN_SEQS: TableDefinition<&str, i64> = TableDefinition::new("min_seqs");

/// Durable counter and document store backed by redb.
///
/// Thread-safe through redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStores {
    db: Arc<Database>,
}

impl RedbStores {
    /// Open or create a redb database at the given path.
    ///
    /// Creates the DOCS, COUNTERS and MIN_SEQS tables if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(DOCS).map_err(io_err)?;
            let _ = txn.open_table(COUNTERS).map_err(io_err)?;
            let _ = txn.open_table(MIN_SEQS).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn load_doc(
        table: &impl ReadableTable<&'static [u8], &'static [u8]>,
        key: &[u8],
    ) -> Result<Option<MsgDoc>, StoreError> {
        match table.get(key).map_err(io_err)? {
            Some(value) => {
                let doc: MsgDoc = ciborium::from_reader(value.value())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(doc))
            },
            None => Ok(None),
        }
    }
}

fn io_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Encode a bucket key: conversation bytes, a 0x00 separator, then the
/// bucket ordinal big-endian so lexicographic order matches numeric order.
fn encode_doc_key(doc_id: &DocId) -> Result<Vec<u8>, StoreError> {
    let (conversation, bucket) = match (doc_id.conversation(), doc_id.bucket()) {
        (Some(conversation), Some(bucket)) => (conversation, bucket),
        _ => return Err(StoreError::Io(format!("malformed doc id: {doc_id}"))),
    };
    Ok(encode_bucket_key(&conversation, bucket as u64))
}

fn encode_bucket_key(conversation: &ConversationId, bucket: u64) -> Vec<u8> {
    let raw = conversation.as_str().as_bytes();
    let mut key = Vec::with_capacity(raw.len() + 9);
    key.extend_from_slice(raw);
    key.push(0);
    key.extend_from_slice(&bucket.to_be_bytes());
    key
}

/// Exclusive upper bound for a conversation's bucket-key range.
fn conversation_range_end(conversation: &ConversationId) -> Vec<u8> {
    let raw = conversation.as_str().as_bytes();
    let mut key = Vec::with_capacity(raw.len() + 1);
    key.extend_from_slice(raw);
    key.push(1);
    key
}

#[async_trait]
impl SeqCounterStore for RedbStores {
    async fn malloc(&self, conversation: &ConversationId, size: i64) -> Result<i64, StoreError> {
        if size < 0 {
            return Err(StoreError::InvalidCounter(format!("negative malloc size {size}")));
        }
        let txn = self.db.begin_write().map_err(io_err)?;
        let old = {
            let mut table = txn.open_table(COUNTERS).map_err(io_err)?;
            let old =
                table.get(conversation.as_str()).map_err(io_err)?.map_or(0, |v| v.value());
            if size > 0 {
                table.insert(conversation.as_str(), old + size).map_err(io_err)?;
            }
            old
        };
        txn.commit().map_err(io_err)?;
        Ok(old)
    }

    async fn get_min(&self, conversation: &ConversationId) -> Result<i64, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(MIN_SEQS).map_err(io_err)?;
        Ok(table.get(conversation.as_str()).map_err(io_err)?.map_or(0, |v| v.value()))
    }

    async fn set_min(&self, conversation: &ConversationId, seq: i64) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(MIN_SEQS).map_err(io_err)?;
            table.insert(conversation.as_str(), seq).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl MsgDocDatabase for RedbStores {
    async fn create(&self, doc: &MsgDoc) -> Result<(), StoreError> {
        let key = encode_doc_key(&doc.doc_id)?;
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(DOCS).map_err(io_err)?;
            if table.get(key.as_slice()).map_err(io_err)?.is_some() {
                return Err(StoreError::DuplicateDoc(doc.doc_id.to_string()));
            }

            let mut bytes = Vec::new();
            ciborium::into_writer(doc, &mut bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    async fn update_slot(
        &self,
        doc_id: &DocId,
        index: usize,
        update: &SlotUpdate,
    ) -> Result<bool, StoreError> {
        let key = encode_doc_key(doc_id)?;
        let txn = self.db.begin_write().map_err(io_err)?;
        let matched = {
            let mut table = txn.open_table(DOCS).map_err(io_err)?;
            let Some(mut doc) = Self::load_doc(&table, &key)? else {
                return Ok(false);
            };
            let Some(slot) = doc.slots.get_mut(index) else {
                return Err(StoreError::Io(format!(
                    "slot index {index} out of range for doc {doc_id}"
                )));
            };
            update.apply(slot);

            let mut bytes = Vec::new();
            ciborium::into_writer(&doc, &mut bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
            true
        };
        txn.commit().map_err(io_err)?;
        Ok(matched)
    }

    async fn find_doc(&self, doc_id: &DocId) -> Result<Option<MsgDoc>, StoreError> {
        let key = encode_doc_key(doc_id)?;
        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(DOCS).map_err(io_err)?;
        Self::load_doc(&table, &key)
    }

    async fn find_slots(
        &self,
        doc_id: &DocId,
        indexes: &[usize],
    ) -> Result<Option<Vec<MsgSlot>>, StoreError> {
        Ok(self.find_doc(doc_id).await?.map(|doc| {
            indexes.iter().map(|&i| doc.slots.get(i).cloned().unwrap_or_default()).collect()
        }))
    }

    async fn doc_by_position(
        &self,
        conversation: &ConversationId,
        position: u64,
    ) -> Result<Option<MsgDoc>, StoreError> {
        let start = encode_bucket_key(conversation, 0);
        let end = conversation_range_end(conversation);

        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(DOCS).map_err(io_err)?;
        let mut results = table.range(start.as_slice()..end.as_slice()).map_err(io_err)?;

        let mut skipped = 0u64;
        while let Some(result) = results.next() {
            let (_, value) = result.map_err(io_err)?;
            if skipped == position {
                let doc: MsgDoc = ciborium::from_reader(value.value())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                return Ok(Some(doc));
            }
            skipped += 1;
        }
        Ok(None)
    }

    async fn doc_count(&self, conversation: &ConversationId) -> Result<u64, StoreError> {
        let start = encode_bucket_key(conversation, 0);
        let end = conversation_range_end(conversation);

        let txn = self.db.begin_read().map_err(io_err)?;
        let table = txn.open_table(DOCS).map_err(io_err)?;
        let results = table.range(start.as_slice()..end.as_slice()).map_err(io_err)?;

        let mut count = 0u64;
        for result in results {
            result.map_err(io_err)?;
            count += 1;
        }
        Ok(count)
    }

    async fn delete_doc(&self, doc_id: &DocId) -> Result<(), StoreError> {
        let key = encode_doc_key(doc_id)?;
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(DOCS).map_err(io_err)?;
            table.remove(key.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    async fn delete_slots(&self, doc_id: &DocId, indexes: &[usize]) -> Result<(), StoreError> {
        let key = encode_doc_key(doc_id)?;
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = txn.open_table(DOCS).map_err(io_err)?;
            let Some(mut doc) = Self::load_doc(&table, &key)? else {
                return Err(StoreError::NotFound(doc_id.to_string()));
            };
            for &index in indexes {
                if let Some(slot) = doc.slots.get_mut(index) {
                    *slot = MsgSlot::default();
                }
            }
            let mut bytes = Vec::new();
            ciborium::into_writer(&doc, &mut bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            table.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }
}
