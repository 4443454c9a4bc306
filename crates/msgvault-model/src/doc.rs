//! Bucket documents and the pure addressing math.
//!
//! A bucket holds a fixed-capacity contiguous range of sequence slots and
//! is addressed by `"{conversation}:{seq / capacity}"`. Both the document
//! ID and the in-document index are pure functions of
//! `(conversation, seq, capacity)`, so no coordination is needed to know
//! where a message lives.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationId;
use crate::message::{MessageRecord, MsgSlot, RevokeRecord, UserId};

/// Deterministic bucket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Derive the bucket address for a seq.
    ///
    /// `capacity` must be the conversation's fixed bucket capacity;
    /// changing it for existing data re-derives different IDs and breaks
    /// lookups.
    pub fn derive(conversation: &ConversationId, seq: i64, capacity: i64) -> Self {
        debug_assert!(capacity > 0);
        debug_assert!(seq >= 0);
        Self(format!("{}:{}", conversation.as_str(), seq / capacity))
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the conversation ID this bucket belongs to.
    ///
    /// `None` if the raw form does not contain the `:` separator (a
    /// corrupt or foreign key).
    pub fn conversation(&self) -> Option<ConversationId> {
        self.0.rsplit_once(':').map(|(conversation, _)| ConversationId::new(conversation))
    }

    /// Bucket ordinal within the conversation (the `seq / capacity` part).
    pub fn bucket(&self) -> Option<i64> {
        self.0.rsplit_once(':').and_then(|(_, bucket)| bucket.parse().ok())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-document slot index for a seq.
pub fn slot_index(seq: i64, capacity: i64) -> usize {
    debug_assert!(capacity > 0);
    debug_assert!(seq >= 0);
    (seq % capacity) as usize
}

/// First seq stored by the bucket containing `seq`.
pub fn bucket_base_seq(seq: i64, capacity: i64) -> i64 {
    (seq / capacity) * capacity
}

/// One persistent bucket: a fixed-capacity ordered array of slots.
///
/// Invariant: `slots[i]` holds the message whose
/// `seq == bucket_base_seq + i`. Unused slots are empty placeholders so
/// later per-slot updates always have a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDoc {
    /// Bucket address.
    pub doc_id: DocId,
    /// Sequence slots, exactly `capacity` of them.
    pub slots: Vec<MsgSlot>,
}

impl MsgDoc {
    /// A fresh bucket with every slot empty.
    pub fn empty(doc_id: DocId, capacity: i64) -> Self {
        Self { doc_id, slots: vec![MsgSlot::default(); capacity as usize] }
    }
}

/// Typed partial-update payload for one slot.
///
/// Replaces the original's dynamic `map[string]any` update documents:
/// exactly one named field is written, everything else is untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Write the message field.
    Msg(MessageRecord),
    /// Write the revocation overlay.
    Revoke(RevokeRecord),
    /// Add a user to the slot's deletion list.
    DelUser(UserId),
}

impl SlotUpdate {
    /// The seq this update targets.
    ///
    /// Revoke overlays carry no seq of their own; callers position them
    /// with an explicit first-seq argument.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Msg(msg) => Some(msg.seq),
            Self::Revoke(_) | Self::DelUser(_) => None,
        }
    }

    /// Apply this update to a slot in place.
    pub fn apply(&self, slot: &mut MsgSlot) {
        match self {
            Self::Msg(msg) => slot.msg = Some(msg.clone()),
            Self::Revoke(revoke) => slot.revoke = Some(revoke.clone()),
            Self::DelUser(user) => {
                if !slot.del_list.contains(user) {
                    slot.del_list.push(user.clone());
                }
            },
        }
    }
}

/// Group seqs by the bucket that stores them, preserving input order
/// within each bucket.
pub fn group_seqs_by_doc(
    conversation: &ConversationId,
    seqs: &[i64],
    capacity: i64,
) -> Vec<(DocId, Vec<i64>)> {
    let mut grouped: Vec<(DocId, Vec<i64>)> = Vec::new();
    for &seq in seqs {
        let doc_id = DocId::derive(conversation, seq, capacity);
        match grouped.iter_mut().find(|(id, _)| *id == doc_id) {
            Some((_, bucket_seqs)) => bucket_seqs.push(seq),
            None => grouped.push((doc_id, vec![seq])),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_doc_id_changes_every_capacity() {
        let conversation = ConversationId::new("si_1_2");
        assert_eq!(DocId::derive(&conversation, 0, 100).as_str(), "si_1_2:0");
        assert_eq!(DocId::derive(&conversation, 99, 100).as_str(), "si_1_2:0");
        assert_eq!(DocId::derive(&conversation, 100, 100).as_str(), "si_1_2:1");
        assert_eq!(DocId::derive(&conversation, 105, 100).as_str(), "si_1_2:1");
    }

    #[test]
    fn test_doc_id_conversation_roundtrip() {
        let conversation = ConversationId::new("g_7");
        let doc_id = DocId::derive(&conversation, 1234, 500);
        assert_eq!(doc_id.conversation(), Some(conversation));
    }

    #[test]
    fn test_group_seqs_spanning_buckets() {
        let conversation = ConversationId::new("si_1_2");
        let seqs: Vec<i64> = (95..=105).collect();
        let grouped = group_seqs_by_doc(&conversation, &seqs, 100);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0.as_str(), "si_1_2:0");
        assert_eq!(grouped[0].1, vec![95, 96, 97, 98, 99]);
        assert_eq!(grouped[1].0.as_str(), "si_1_2:1");
        assert_eq!(grouped[1].1, vec![100, 101, 102, 103, 104, 105]);
    }

    proptest! {
        /// `slot_index` cycles 0..capacity-1 and `DocId` changes exactly
        /// every `capacity` seqs.
        #[test]
        fn prop_bucket_addressing(capacity in 1i64..=500, step in 0i64..5000) {
            let conversation = ConversationId::new("si_a_b");
            let seq = step % (10 * capacity);

            let index = slot_index(seq, capacity);
            prop_assert_eq!(index as i64, seq % capacity);
            prop_assert!((index as i64) < capacity);

            let doc_id = DocId::derive(&conversation, seq, capacity);
            let expected = format!("si_a_b:{}", seq / capacity);
            prop_assert_eq!(doc_id.as_str(), expected.as_str());

            prop_assert_eq!(bucket_base_seq(seq, capacity) + index as i64, seq);
        }
    }
}
