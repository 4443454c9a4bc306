//! High-level bucketed message store.
//!
//! Wraps a [`MsgDocDatabase`] with the insert-or-update block writer, read
//! paths that apply the per-user deletion mask and the revoke and quote
//! overlays, and time-based retention.

use bytes::Bytes;
use msgvault_model::{
    BucketConfig, ContentType, ConversationId, DocId, MessageRecord, MsgDoc, MsgSlot, MsgStatus,
    QuoteContent, RevokeRecord, SlotUpdate, UserId, group_seqs_by_doc, slot_index,
};
use tracing::warn;

use crate::{counter::SeqCounterStore, db::MsgDocDatabase, error::StoreError};

/// Result of a retention pass over one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Slot indexes whose messages were purged.
    pub deleted_indexes: Vec<usize>,
    /// Whether the whole bucket was removed (every populated slot expired).
    pub doc_removed: bool,
}

/// Bucketed message store over a document database and a durable counter.
///
/// Clones share the underlying database handles.
#[derive(Clone)]
pub struct MsgDocStore<D, S> {
    db: D,
    counters: S,
    buckets: BucketConfig,
}

impl<D, S> MsgDocStore<D, S>
where
    D: MsgDocDatabase,
    S: SeqCounterStore,
{
    /// Create a store over the given database and counter backends.
    pub fn new(db: D, counters: S, buckets: BucketConfig) -> Self {
        Self { db, counters, buckets }
    }

    /// The bucket capacity used for a conversation.
    pub fn capacity(&self, conversation: &ConversationId) -> i64 {
        self.buckets.capacity(conversation)
    }

    /// Write a contiguous block of messages starting at `first_seq`.
    ///
    /// Walks the block trying in-place slot updates first. When a bucket
    /// does not exist yet, the full bucket document is built (placeholders
    /// pre-filled) and inserted in one call; a duplicate-key conflict from
    /// a racing writer flips the walk back to update mode for the same
    /// sub-range. Insert and update are complementary, so replaying the
    /// same block is idempotent.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidSequenceRange`] if `records[i].seq` is not
    /// `first_seq + i` for every position.
    pub async fn batch_insert_block(
        &self,
        conversation: &ConversationId,
        records: &[MessageRecord],
        first_seq: i64,
    ) -> Result<(), StoreError> {
        let capacity = self.buckets.capacity(conversation);
        for (i, record) in records.iter().enumerate() {
            let expected = first_seq + i as i64;
            if record.seq != expected {
                return Err(StoreError::InvalidSequenceRange { expected, got: record.seq });
            }
        }

        let mut try_update = true;
        let mut i = 0;
        while i < records.len() {
            let seq = first_seq + i as i64;
            let doc_id = DocId::derive(conversation, seq, capacity);

            if try_update {
                let update = SlotUpdate::Msg(records[i].clone());
                if self.db.update_slot(&doc_id, slot_index(seq, capacity), &update).await? {
                    i += 1;
                } else {
                    // Bucket missing; fall through to insert mode for it.
                    try_update = false;
                }
                continue;
            }

            let mut doc = MsgDoc::empty(doc_id.clone(), capacity);
            let mut j = i;
            while j < records.len() {
                let seq = first_seq + j as i64;
                if DocId::derive(conversation, seq, capacity) != doc_id {
                    break;
                }
                doc.slots[slot_index(seq, capacity)].msg = Some(records[j].clone());
                j += 1;
            }

            match self.db.create(&doc).await {
                Ok(()) => i = j,
                Err(StoreError::DuplicateDoc(_)) => {
                    // A racing writer created the bucket first; write our
                    // slots into it instead.
                    try_update = true;
                },
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read the given seqs as `user`, one record per requested seq.
    ///
    /// Missing buckets and never-written slots come back as empty
    /// placeholder records. Soft-deleted messages (the user appears in the
    /// slot's del-list) are returned with cleared content and
    /// [`MsgStatus::Deleted`]. Revoked messages are rewritten to revoke
    /// notifications. Quote messages are reconciled against the quoted
    /// message's current state (see [`Self::resolve_quote`]).
    pub async fn get_by_seqs(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        seqs: &[i64],
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let capacity = self.buckets.capacity(conversation);
        let mut records = Vec::with_capacity(seqs.len());

        for (doc_id, doc_seqs) in group_seqs_by_doc(conversation, seqs, capacity) {
            let indexes: Vec<usize> =
                doc_seqs.iter().map(|&seq| slot_index(seq, capacity)).collect();
            let slots = self.db.find_slots(&doc_id, &indexes).await?;

            for (pos, &seq) in doc_seqs.iter().enumerate() {
                let slot = slots.as_ref().and_then(|s| s.get(pos)).cloned().unwrap_or_default();
                records.push(self.render_slot(conversation, seq, slot, user).await);
            }
        }
        Ok(records)
    }

    /// Read the half-open seq range `[begin, end)` as `user`.
    pub async fn get_by_seq_range(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        begin: i64,
        end: i64,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let seqs: Vec<i64> = (begin..end).collect();
        self.get_by_seqs(conversation, user, &seqs).await
    }

    /// Project one slot into the record the reader sees.
    async fn render_slot(
        &self,
        conversation: &ConversationId,
        seq: i64,
        slot: MsgSlot,
        user: &UserId,
    ) -> MessageRecord {
        let Some(mut record) = slot.msg else {
            return MessageRecord::placeholder(seq);
        };

        if slot.del_list.contains(user) {
            record.content = Bytes::new();
            record.status = MsgStatus::Deleted;
            return record;
        }

        if let Some(revoke) = &slot.revoke {
            return revoked_record(&record, revoke);
        }

        if record.content_type == ContentType::Quote {
            record = self.resolve_quote(conversation, record).await;
        }
        record
    }

    /// Reconcile a quote message with the quoted message's current state.
    ///
    /// If the quoted message has been revoked since the quote was stored,
    /// the embedded snapshot is rewritten to a revoke notification exactly
    /// once (the content-type guard makes repeats no-ops) and persisted in
    /// place. Reconciliation failures are logged and the stored form is
    /// returned unchanged; readers never see an error from this path.
    async fn resolve_quote(
        &self,
        conversation: &ConversationId,
        mut record: MessageRecord,
    ) -> MessageRecord {
        let quote: QuoteContent = match ciborium::from_reader(record.content.as_ref()) {
            Ok(quote) => quote,
            Err(e) => {
                warn!(
                    conversation_id = %conversation,
                    seq = record.seq,
                    error = %e,
                    "undecodable quote content, serving stored form"
                );
                return record;
            },
        };
        let Some(quoted) = &quote.quoted else {
            return record;
        };
        if quoted.content_type == ContentType::RevokeNotification {
            return record;
        }

        let revoke = match self.revoke_of(conversation, quoted.seq).await {
            Ok(revoke) => revoke,
            Err(e) => {
                warn!(
                    conversation_id = %conversation,
                    seq = record.seq,
                    quoted_seq = quoted.seq,
                    error = %e,
                    "quote reconciliation lookup failed, serving stored form"
                );
                return record;
            },
        };
        let Some(revoke) = revoke else {
            return record;
        };

        let reconciled =
            QuoteContent { text: quote.text, quoted: Some(revoked_record(quoted, &revoke)) };
        let mut content = Vec::new();
        if let Err(e) = ciborium::into_writer(&reconciled, &mut content) {
            warn!(seq = record.seq, error = %e, "quote re-encode failed, serving stored form");
            return record;
        }
        record.content = Bytes::from(content);

        let capacity = self.buckets.capacity(conversation);
        let doc_id = DocId::derive(conversation, record.seq, capacity);
        let update = SlotUpdate::Msg(record.clone());
        if let Err(e) =
            self.db.update_slot(&doc_id, slot_index(record.seq, capacity), &update).await
        {
            warn!(
                conversation_id = %conversation,
                seq = record.seq,
                error = %e,
                "persisting reconciled quote failed"
            );
        }
        record
    }

    /// Current revocation overlay of a seq, if any.
    async fn revoke_of(
        &self,
        conversation: &ConversationId,
        seq: i64,
    ) -> Result<Option<RevokeRecord>, StoreError> {
        let capacity = self.buckets.capacity(conversation);
        let doc_id = DocId::derive(conversation, seq, capacity);
        let slots = self.db.find_slots(&doc_id, &[slot_index(seq, capacity)]).await?;
        Ok(slots.and_then(|mut s| s.pop()).and_then(|slot| slot.revoke))
    }

    /// Record a revocation overlay for a seq.
    ///
    /// The original record stays in place; reads rewrite it on the fly.
    pub async fn revoke_msg(
        &self,
        conversation: &ConversationId,
        seq: i64,
        revoke: RevokeRecord,
    ) -> Result<(), StoreError> {
        let capacity = self.buckets.capacity(conversation);
        let doc_id = DocId::derive(conversation, seq, capacity);
        let matched = self
            .db
            .update_slot(&doc_id, slot_index(seq, capacity), &SlotUpdate::Revoke(revoke))
            .await?;
        if !matched {
            return Err(StoreError::NotFound(doc_id.to_string()));
        }
        Ok(())
    }

    /// Soft-delete the given seqs for one user.
    ///
    /// Other readers still see the messages; this user's reads come back
    /// masked. Seqs in buckets that do not exist are skipped.
    pub async fn mark_deleted_for_user(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        seqs: &[i64],
    ) -> Result<(), StoreError> {
        let capacity = self.buckets.capacity(conversation);
        let update = SlotUpdate::DelUser(user.clone());
        for (doc_id, doc_seqs) in group_seqs_by_doc(conversation, seqs, capacity) {
            for seq in doc_seqs {
                self.db.update_slot(&doc_id, slot_index(seq, capacity), &update).await?;
            }
        }
        Ok(())
    }

    /// Purge messages in `doc` sent before `ts` (unix millis).
    ///
    /// Removes the whole bucket when every populated slot has expired,
    /// otherwise clears only the expired slots. Raises the conversation's
    /// retention floor to one past the highest purged seq; the floor never
    /// moves backwards.
    pub async fn delete_doc_before(
        &self,
        ts: i64,
        doc: &MsgDoc,
    ) -> Result<RetentionOutcome, StoreError> {
        let Some(conversation) = doc.doc_id.conversation() else {
            return Err(StoreError::NotFound(doc.doc_id.to_string()));
        };
        let Some(bucket) = doc.doc_id.bucket() else {
            return Err(StoreError::NotFound(doc.doc_id.to_string()));
        };
        let base_seq = bucket * doc.slots.len() as i64;

        let mut deleted = Vec::new();
        let mut populated = 0usize;
        for (index, slot) in doc.slots.iter().enumerate() {
            let Some(msg) = &slot.msg else { continue };
            populated += 1;
            if msg.send_time < ts {
                deleted.push(index);
            }
        }
        if deleted.is_empty() {
            return Ok(RetentionOutcome { deleted_indexes: deleted, doc_removed: false });
        }

        let doc_removed = deleted.len() == populated;
        if doc_removed {
            self.db.delete_doc(&doc.doc_id).await?;
        } else {
            self.db.delete_slots(&doc.doc_id, &deleted).await?;
        }

        // `deleted` is in ascending index order, so the last entry is the
        // highest purged seq.
        if let Some(&max_index) = deleted.last() {
            let floor = base_seq + max_index as i64 + 1;
            if floor > self.counters.get_min(&conversation).await? {
                self.counters.set_min(&conversation, floor).await?;
            }
        }
        Ok(RetentionOutcome { deleted_indexes: deleted, doc_removed })
    }

    /// The `position`-th bucket of a conversation, for retention scans.
    pub async fn doc_by_position(
        &self,
        conversation: &ConversationId,
        position: u64,
    ) -> Result<Option<MsgDoc>, StoreError> {
        self.db.doc_by_position(conversation, position).await
    }

    /// The newest stored message of a conversation, skipping empty slots.
    pub async fn newest_msg(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let count = self.db.doc_count(conversation).await?;
        for position in (0..count).rev() {
            let Some(doc) = self.db.doc_by_position(conversation, position).await? else {
                continue;
            };
            if let Some(msg) = doc.slots.iter().rev().find_map(|slot| slot.msg.clone()) {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// The oldest stored message of a conversation, skipping empty slots.
    pub async fn oldest_msg(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let count = self.db.doc_count(conversation).await?;
        for position in 0..count {
            let Some(doc) = self.db.doc_by_position(conversation, position).await? else {
                continue;
            };
            if let Some(msg) = doc.slots.iter().find_map(|slot| slot.msg.clone()) {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }
}

/// The record a reader sees for a revoked message.
fn revoked_record(record: &MessageRecord, revoke: &RevokeRecord) -> MessageRecord {
    let mut rewritten = record.clone();
    rewritten.content_type = ContentType::RevokeNotification;
    let mut content = Vec::new();
    match ciborium::into_writer(revoke, &mut content) {
        Ok(()) => rewritten.content = Bytes::from(content),
        Err(e) => {
            warn!(seq = record.seq, error = %e, "revoke overlay encode failed");
            rewritten.content = Bytes::new();
        },
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStores;

    fn setup() -> (MemoryStores, MsgDocStore<MemoryStores, MemoryStores>) {
        let backend = MemoryStores::new();
        let store = MsgDocStore::new(backend.clone(), backend.clone(), BucketConfig::default());
        (backend, store)
    }

    fn record(seq: i64) -> MessageRecord {
        let mut record = MessageRecord::placeholder(seq);
        record.send_id = "u1".to_owned();
        record.content_type = ContentType::Text;
        record.content = Bytes::from(format!("msg-{seq}"));
        record.send_time = 1_000 + seq;
        record
    }

    fn block(first_seq: i64, len: usize) -> Vec<MessageRecord> {
        (0..len as i64).map(|i| record(first_seq + i)).collect()
    }

    #[tokio::test]
    async fn test_block_spanning_buckets() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");

        // 95..=105 crosses the capacity-100 bucket boundary.
        store.batch_insert_block(&conversation, &block(95, 11), 95).await.unwrap();

        let records =
            store.get_by_seqs(&conversation, &"u2".to_owned(), &[95, 99, 100, 105]).await.unwrap();
        assert_eq!(records.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![95, 99, 100, 105]);
        assert!(records.iter().all(|m| !m.content.is_empty()));
    }

    #[tokio::test]
    async fn test_block_insert_is_idempotent() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        let records = block(0, 5);

        store.batch_insert_block(&conversation, &records, 0).await.unwrap();
        store.batch_insert_block(&conversation, &records, 0).await.unwrap();

        let read = store.get_by_seqs(&conversation, &"u2".to_owned(), &[0, 4]).await.unwrap();
        assert_eq!(read[0].content, records[0].content);
        assert_eq!(read[1].content, records[4].content);
    }

    #[tokio::test]
    async fn test_block_rejects_gaps() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        let mut records = block(0, 3);
        records[2].seq = 5;

        let result = store.batch_insert_block(&conversation, &records, 0).await;
        assert_eq!(result, Err(StoreError::InvalidSequenceRange { expected: 2, got: 5 }));
    }

    #[tokio::test]
    async fn test_missing_seqs_read_as_placeholders() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(0, 2), 0).await.unwrap();

        let records =
            store.get_by_seq_range(&conversation, &"u2".to_owned(), 0, 4).await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(!records[1].content.is_empty());
        assert!(records[2].content.is_empty());
        assert_eq!(records[3].seq, 3);
    }

    #[tokio::test]
    async fn test_del_list_masks_per_user() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(0, 1), 0).await.unwrap();
        store.mark_deleted_for_user(&conversation, &"u2".to_owned(), &[0]).await.unwrap();

        let masked = store.get_by_seqs(&conversation, &"u2".to_owned(), &[0]).await.unwrap();
        assert_eq!(masked[0].status, MsgStatus::Deleted);
        assert!(masked[0].content.is_empty());

        let visible = store.get_by_seqs(&conversation, &"u3".to_owned(), &[0]).await.unwrap();
        assert_eq!(visible[0].status, MsgStatus::SendSuccess);
        assert!(!visible[0].content.is_empty());
    }

    #[tokio::test]
    async fn test_revoke_overlay_rewrites_read() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(0, 2), 0).await.unwrap();

        let revoke =
            RevokeRecord { user_id: "u1".to_owned(), role: 0, nickname: "A".to_owned(), time: 9 };
        store.revoke_msg(&conversation, 1, revoke.clone()).await.unwrap();

        let records = store.get_by_seqs(&conversation, &"u2".to_owned(), &[0, 1]).await.unwrap();
        assert_eq!(records[0].content_type, ContentType::Text);
        assert_eq!(records[1].content_type, ContentType::RevokeNotification);
        let decoded: RevokeRecord = ciborium::from_reader(records[1].content.as_ref()).unwrap();
        assert_eq!(decoded, revoke);
    }

    #[tokio::test]
    async fn test_revoke_missing_msg_fails() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        let revoke =
            RevokeRecord { user_id: "u1".to_owned(), role: 0, nickname: "A".to_owned(), time: 9 };
        let result = store.revoke_msg(&conversation, 7, revoke).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_quote_overlay_reconciles_once() {
        let (backend, store) = setup();
        let conversation = ConversationId::new("si_1_2");

        let mut records = block(0, 2);
        let quote = QuoteContent { text: "re: hi".to_owned(), quoted: Some(records[0].clone()) };
        let mut content = Vec::new();
        ciborium::into_writer(&quote, &mut content).unwrap();
        records[1].content_type = ContentType::Quote;
        records[1].content = Bytes::from(content);
        store.batch_insert_block(&conversation, &records, 0).await.unwrap();

        // Quote reads clean while the quoted message is intact.
        let read = store.get_by_seqs(&conversation, &"u2".to_owned(), &[1]).await.unwrap();
        let decoded: QuoteContent = ciborium::from_reader(read[0].content.as_ref()).unwrap();
        assert_eq!(
            decoded.quoted.as_ref().map(|q| q.content_type),
            Some(ContentType::Text)
        );

        let revoke =
            RevokeRecord { user_id: "u1".to_owned(), role: 0, nickname: "A".to_owned(), time: 9 };
        store.revoke_msg(&conversation, 0, revoke).await.unwrap();

        // First read after the revoke rewrites the snapshot and persists it.
        let read = store.get_by_seqs(&conversation, &"u2".to_owned(), &[1]).await.unwrap();
        let decoded: QuoteContent = ciborium::from_reader(read[0].content.as_ref()).unwrap();
        assert_eq!(
            decoded.quoted.as_ref().map(|q| q.content_type),
            Some(ContentType::RevokeNotification)
        );

        // The rewrite is durable: the stored slot now carries the
        // reconciled snapshot.
        let doc_id = DocId::derive(&conversation, 1, 100);
        let stored = backend.find_doc(&doc_id).await.unwrap().unwrap();
        let stored_msg = stored.slots[1].msg.as_ref().unwrap();
        let stored_quote: QuoteContent =
            ciborium::from_reader(stored_msg.content.as_ref()).unwrap();
        assert_eq!(
            stored_quote.quoted.as_ref().map(|q| q.content_type),
            Some(ContentType::RevokeNotification)
        );
    }

    #[tokio::test]
    async fn test_retention_partial_bucket() {
        let (backend, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(0, 4), 0).await.unwrap();

        // record(seq) has send_time 1000 + seq; expire seqs 0 and 1.
        let doc = store.doc_by_position(&conversation, 0).await.unwrap().unwrap();
        let outcome = store.delete_doc_before(1_002, &doc).await.unwrap();
        assert_eq!(outcome, RetentionOutcome { deleted_indexes: vec![0, 1], doc_removed: false });

        assert_eq!(backend.get_min(&conversation).await.unwrap(), 2);
        let records = store.get_by_seqs(&conversation, &"u2".to_owned(), &[0, 2]).await.unwrap();
        assert!(records[0].content.is_empty());
        assert!(!records[1].content.is_empty());
    }

    #[tokio::test]
    async fn test_retention_removes_fully_expired_bucket() {
        let (backend, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(0, 4), 0).await.unwrap();

        let doc = store.doc_by_position(&conversation, 0).await.unwrap().unwrap();
        let outcome = store.delete_doc_before(2_000, &doc).await.unwrap();
        assert!(outcome.doc_removed);
        assert_eq!(outcome.deleted_indexes, vec![0, 1, 2, 3]);
        assert!(store.doc_by_position(&conversation, 0).await.unwrap().is_none());
        assert_eq!(backend.get_min(&conversation).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_retention_floor_only_raises() {
        let (backend, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(0, 2), 0).await.unwrap();
        backend.set_min(&conversation, 50).await.unwrap();

        let doc = store.doc_by_position(&conversation, 0).await.unwrap().unwrap();
        store.delete_doc_before(2_000, &doc).await.unwrap();
        assert_eq!(backend.get_min(&conversation).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_newest_and_oldest_skip_empty_slots() {
        let (_, store) = setup();
        let conversation = ConversationId::new("si_1_2");
        store.batch_insert_block(&conversation, &block(3, 2), 3).await.unwrap();
        store.batch_insert_block(&conversation, &block(101, 1), 101).await.unwrap();

        assert_eq!(store.newest_msg(&conversation).await.unwrap().map(|m| m.seq), Some(101));
        assert_eq!(store.oldest_msg(&conversation).await.unwrap().map(|m| m.seq), Some(3));

        let empty = ConversationId::new("si_9_9");
        assert_eq!(store.newest_msg(&empty).await.unwrap(), None);
    }
}
