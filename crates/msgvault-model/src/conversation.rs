//! Conversation identity and per-kind bucket configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a chat channel (1:1 or group).
///
/// The raw form carries the conversation kind as a prefix: group
/// conversations start with `g_`, everything else is a direct (1:1)
/// conversation. The kind decides bucket capacity and allocation headroom,
/// so it must be derivable from the ID alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

/// Conversation class, derived from the ID prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    /// 1:1 conversation.
    Direct,
    /// Group conversation. Fans out to more readers and writers, so it gets
    /// larger buckets and a larger allocation window.
    Group,
}

impl ConversationId {
    /// Group-conversation ID prefix.
    pub const GROUP_PREFIX: &'static str = "g_";

    /// Wrap a raw conversation ID.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conversation class, decided by the ID prefix.
    pub fn kind(&self) -> ConversationKind {
        if self.0.starts_with(Self::GROUP_PREFIX) {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Fixed per-kind bucket capacities.
///
/// Capacity is part of the on-disk addressing scheme: `DocId` derivation
/// divides the seq by it. It must be fixed at deployment time and never
/// changed for existing data, or existing lookups break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    /// Slots per bucket for direct conversations.
    pub direct: i64,
    /// Slots per bucket for group conversations.
    pub group: i64,
}

impl BucketConfig {
    /// Bucket capacity for the given conversation.
    pub fn capacity(&self, conversation: &ConversationId) -> i64 {
        match conversation.kind() {
            ConversationKind::Direct => self.direct,
            ConversationKind::Group => self.group,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { direct: 100, group: 500 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_prefix() {
        assert_eq!(ConversationId::new("g_42").kind(), ConversationKind::Group);
        assert_eq!(ConversationId::new("si_100_200").kind(), ConversationKind::Direct);
        assert_eq!(ConversationId::new("n_7").kind(), ConversationKind::Direct);
    }

    #[test]
    fn test_capacity_per_kind() {
        let config = BucketConfig::default();
        assert_eq!(config.capacity(&ConversationId::new("si_1_2")), 100);
        assert_eq!(config.capacity(&ConversationId::new("g_1")), 500);
    }
}
