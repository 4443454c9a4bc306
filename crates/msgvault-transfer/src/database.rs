//! Glue database for the transfer pipeline.
//!
//! Binds the sequence allocator, the advisory message cache, the durable
//! document store and the outbound queues together. The hot path
//! ([`batch_insert_to_cache`](TransferDb::batch_insert_to_cache)) touches
//! only the allocator and the cache; durable flushing happens later from
//! the store queue.

use std::collections::HashMap;

use msgvault_cache::{KvCache, MessageCache, SeqAllocator, SeqWindowCache};
use msgvault_model::{ConversationId, MessageRecord, UserId};
use msgvault_store::{MsgDocDatabase, MsgDocStore, SeqCounterStore};
use tracing::warn;

use crate::{
    error::TransferError,
    transport::{MsgProducer, PushEvent, StoreEvent, encode_event},
};

/// Result of the cache-insert step.
#[derive(Debug, Clone)]
pub struct CacheInsertOutcome {
    /// The input records with their assigned seqs.
    pub records: Vec<MessageRecord>,
    /// Seq assigned to `records[0]`.
    pub first_seq: i64,
    /// Whether this allocation was the conversation's first ever (the
    /// caller may want to initialize conversation metadata).
    pub is_new_conversation: bool,
    /// Highest seq per sender in this batch; senders have implicitly read
    /// their own messages up to it.
    pub read_seqs: HashMap<UserId, i64>,
}

/// The transfer pipeline's view of storage and queues.
#[derive(Clone)]
pub struct TransferDb<K, S, D, P> {
    allocator: SeqAllocator<K, S>,
    msg_cache: MessageCache<K>,
    doc_store: MsgDocStore<D, S>,
    store_producer: P,
    push_producer: P,
}

impl<K, S, D, P> TransferDb<K, S, D, P>
where
    K: SeqWindowCache + KvCache,
    S: SeqCounterStore,
    D: MsgDocDatabase,
    P: MsgProducer,
{
    /// Bind the components together.
    pub fn new(
        allocator: SeqAllocator<K, S>,
        msg_cache: MessageCache<K>,
        doc_store: MsgDocStore<D, S>,
        store_producer: P,
        push_producer: P,
    ) -> Self {
        Self { allocator, msg_cache, doc_store, store_producer, push_producer }
    }

    /// The underlying document store.
    pub fn doc_store(&self) -> &MsgDocStore<D, S> {
        &self.doc_store
    }

    /// Assign seqs to a batch and write it through the message cache.
    ///
    /// # Errors
    ///
    /// [`TransferError::EmptyBatch`] for an empty input; allocation and
    /// cache failures propagate (the batch is not partially applied: seq
    /// assignment happens before any write).
    pub async fn batch_insert_to_cache(
        &self,
        conversation: &ConversationId,
        mut records: Vec<MessageRecord>,
    ) -> Result<CacheInsertOutcome, TransferError> {
        if records.is_empty() {
            return Err(TransferError::EmptyBatch);
        }

        let first_seq = self.allocator.malloc(conversation, records.len() as i64).await?;
        let is_new_conversation = first_seq == 0;

        let mut read_seqs: HashMap<UserId, i64> = HashMap::new();
        for (i, record) in records.iter_mut().enumerate() {
            record.seq = first_seq + i as i64;
            read_seqs
                .entry(record.send_id.clone())
                .and_modify(|seq| *seq = (*seq).max(record.seq))
                .or_insert(record.seq);
        }

        self.msg_cache.set_by_seqs(conversation, &records).await?;
        Ok(CacheInsertOutcome { records, first_seq, is_new_conversation, read_seqs })
    }

    /// Flush a seq-assigned batch to the document store, then evict it
    /// from the message cache.
    ///
    /// Eviction is best-effort: the cache is advisory and its entries
    /// expire on their own, so an eviction failure is logged, not
    /// surfaced.
    pub async fn batch_insert_to_store(
        &self,
        conversation: &ConversationId,
        records: &[MessageRecord],
        first_seq: i64,
    ) -> Result<(), TransferError> {
        self.doc_store.batch_insert_block(conversation, records, first_seq).await?;

        let seqs: Vec<i64> = records.iter().map(|record| record.seq).collect();
        if let Err(e) = self.msg_cache.del_by_seqs(conversation, &seqs).await {
            warn!(
                conversation_id = %conversation,
                error = %e,
                "cache eviction after durable write failed"
            );
        }
        Ok(())
    }

    /// Publish a durable-flush event for a seq-assigned batch.
    pub async fn msg_to_store_queue(
        &self,
        conversation: &ConversationId,
        records: Vec<MessageRecord>,
        first_seq: i64,
    ) -> Result<(), TransferError> {
        let event = StoreEvent { conversation: conversation.clone(), records, first_seq };
        let payload = encode_event(&event)?;
        self.store_producer.send(conversation.as_str(), payload).await?;
        Ok(())
    }

    /// Publish a push fan-out event for a seq-assigned batch.
    pub async fn msg_to_push_queue(
        &self,
        conversation: &ConversationId,
        records: Vec<MessageRecord>,
    ) -> Result<(), TransferError> {
        let event = PushEvent { conversation: conversation.clone(), records };
        let payload = encode_event(&event)?;
        self.push_producer.send(conversation.as_str(), payload).await?;
        Ok(())
    }
}
