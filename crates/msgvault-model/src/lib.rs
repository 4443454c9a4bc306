//! Data model for the msgvault message-persistence core.
//!
//! Defines the conversation and message types shared by the storage and
//! cache layers, plus the pure bucket-addressing math that maps a
//! `(conversation, seq)` pair onto a document ID and in-document slot.
//!
//! Sequence numbers are 0-based and per-conversation: the union of all
//! allocated ranges for a conversation is exactly `[0, S)` with no gaps.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod conversation;
mod doc;
mod message;

pub use conversation::{BucketConfig, ConversationId, ConversationKind};
pub use doc::{DocId, MsgDoc, SlotUpdate, bucket_base_seq, group_seqs_by_doc, slot_index};
pub use message::{
    ContentType, MessageRecord, MsgSlot, MsgStatus, OfflinePushInfo, QuoteContent, RevokeRecord,
    UserId,
};
