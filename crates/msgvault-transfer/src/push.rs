//! Push delivery seams.
//!
//! The pipeline only emits push events; actual delivery (provider wire
//! formats, device tokens, presence) lives behind these traits in other
//! services.

use async_trait::async_trait;
use msgvault_model::{ConversationId, MessageRecord, UserId};

use crate::error::TransferError;

/// Delivery to users with no live connection.
#[async_trait]
pub trait OfflinePusher: Clone + Send + Sync + 'static {
    /// Offer a message to the offline channel for the given users.
    async fn push_offline(
        &self,
        users: &[UserId],
        record: &MessageRecord,
    ) -> Result<(), TransferError>;
}

/// Delivery to connected clients.
#[async_trait]
pub trait OnlinePusher: Clone + Send + Sync + 'static {
    /// Offer a message to every online member of a conversation.
    async fn push_online(
        &self,
        conversation: &ConversationId,
        record: &MessageRecord,
    ) -> Result<(), TransferError>;
}

/// Pusher that drops everything. Used by tests and the demo binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct NopPusher;

#[async_trait]
impl OfflinePusher for NopPusher {
    async fn push_offline(
        &self,
        _users: &[UserId],
        _record: &MessageRecord,
    ) -> Result<(), TransferError> {
        Ok(())
    }
}

#[async_trait]
impl OnlinePusher for NopPusher {
    async fn push_online(
        &self,
        _conversation: &ConversationId,
        _record: &MessageRecord,
    ) -> Result<(), TransferError> {
        Ok(())
    }
}
