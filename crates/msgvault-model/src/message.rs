//! Message records and the per-seq slot that stores them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// User identifier.
pub type UserId = String;

/// Message content class.
///
/// Only the variants the persistence core inspects get their own arm; all
/// other client content types travel as `Other` with their raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    /// Plain text.
    Text,
    /// A message quoting another message; the content blob embeds a
    /// [`QuoteContent`] snapshot of the quoted message.
    Quote,
    /// Notification that a message was revoked. Quote overlays rewrite the
    /// quoted snapshot to this type.
    RevokeNotification,
    /// Read-receipt notification.
    HasReadReceipt,
    /// Any other content class, carrying the client's numeric code.
    Other(i32),
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgStatus {
    /// Accepted by the pipeline, not yet durably stored.
    Sending,
    /// Durably stored.
    SendSuccess,
    /// Durable write could not be confirmed; sender sees "send failed".
    SendFailed,
    /// Soft-deleted for the reading user (del-list masking).
    Deleted,
}

/// Offline-push metadata attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflinePushInfo {
    /// Notification title.
    pub title: String,
    /// Notification body.
    pub desc: String,
    /// Provider extension payload.
    pub ex: String,
}

/// One stored message.
///
/// Immutable once its slot is first populated, except for the revoke
/// overlay which lives beside it in the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Sender user ID.
    pub send_id: UserId,
    /// Recipient user ID (1:1 conversations).
    pub recv_id: UserId,
    /// Group ID (group conversations).
    pub group_id: String,
    /// Client-assigned message ID.
    pub client_msg_id: String,
    /// Server-assigned message ID.
    pub server_msg_id: String,
    /// Content class.
    pub content_type: ContentType,
    /// Raw content bytes; interpretation depends on `content_type`.
    pub content: Bytes,
    /// Per-conversation sequence number (0-based).
    pub seq: i64,
    /// Client send time, unix millis.
    pub send_time: i64,
    /// Server ingest time, unix millis.
    pub create_time: i64,
    /// Delivery status.
    pub status: MsgStatus,
    /// Users @-mentioned by this message.
    pub at_user_ids: Vec<UserId>,
    /// Offline-push metadata, if any.
    pub offline_push: Option<OfflinePushInfo>,
    /// Extension field.
    pub ex: String,
}

impl MessageRecord {
    /// An empty placeholder record for a seq that has no stored message.
    ///
    /// Range reads return these for gaps so callers always get one record
    /// per requested seq.
    pub fn placeholder(seq: i64) -> Self {
        Self {
            send_id: String::new(),
            recv_id: String::new(),
            group_id: String::new(),
            client_msg_id: String::new(),
            server_msg_id: String::new(),
            content_type: ContentType::Other(0),
            content: Bytes::new(),
            seq,
            send_time: 0,
            create_time: 0,
            status: MsgStatus::SendSuccess,
            at_user_ids: Vec::new(),
            offline_push: None,
            ex: String::new(),
        }
    }
}

/// Revocation overlay: records who revoked a message and when, without
/// rewriting the original record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeRecord {
    /// Revoking user.
    pub user_id: UserId,
    /// Revoker's role level at revocation time.
    pub role: i32,
    /// Revoker's display name.
    pub nickname: String,
    /// Revocation time, unix millis.
    pub time: i64,
}

/// One sequence slot inside a bucket document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSlot {
    /// The stored message, `None` until the seq is written.
    pub msg: Option<MessageRecord>,
    /// Revocation overlay, if the message was revoked.
    pub revoke: Option<RevokeRecord>,
    /// Users who soft-deleted this message.
    pub del_list: Vec<UserId>,
}

impl MsgSlot {
    /// Whether no message was ever written into this slot.
    pub fn is_empty(&self) -> bool {
        self.msg.is_none()
    }
}

/// Decoded content of a [`ContentType::Quote`] message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteContent {
    /// The quoting message's own text.
    pub text: String,
    /// Snapshot of the quoted message at quote time. Rewritten to a
    /// revoke notification by the lazy overlay if the quoted message is
    /// revoked later.
    pub quoted: Option<MessageRecord>,
}
