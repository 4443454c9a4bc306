//! Queue transport seams.
//!
//! The pipeline talks to its queues through [`MsgProducer`] and
//! [`OffsetCommitter`]; a broker-backed deployment implements them over
//! its client library. [`ChannelTransport`] is the in-process
//! implementation used by tests and the demo binary: a bounded tokio
//! channel with monotonically assigned offsets.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use msgvault_model::{ConversationId, MessageRecord};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransferError;

/// One message delivered from a queue.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    /// Partition key; the pipeline keys every event by conversation ID so
    /// a conversation's events stay ordered.
    pub key: String,
    /// Opaque payload (CBOR-encoded event).
    pub payload: Bytes,
    /// Queue offset, committed only after the event is durably handled.
    pub offset: i64,
}

/// Producer half of a queue.
#[async_trait]
pub trait MsgProducer: Clone + Send + Sync + 'static {
    /// Publish a payload under a partition key. Returns `(partition,
    /// offset)` of the appended message.
    async fn send(&self, key: &str, payload: Bytes) -> Result<(i32, i64), TransferError>;
}

/// Manual offset commit: acknowledging an offset marks everything up to
/// it as handled. Committing only after the durable write is what makes
/// delivery at-least-once instead of at-most-once.
#[async_trait]
pub trait OffsetCommitter: Clone + Send + Sync + 'static {
    /// Mark `offset` as durably handled.
    async fn commit(&self, offset: i64) -> Result<(), TransferError>;
}

/// Durable-flush event: messages headed for the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEvent {
    /// Target conversation.
    pub conversation: ConversationId,
    /// Records with seqs already assigned.
    pub records: Vec<MessageRecord>,
    /// Seq of `records[0]`.
    pub first_seq: i64,
}

/// Push fan-out event: messages ready to be offered to pushers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    /// Target conversation.
    pub conversation: ConversationId,
    /// Records with seqs already assigned.
    pub records: Vec<MessageRecord>,
}

/// CBOR-encode a queue event.
pub fn encode_event<T: Serialize>(event: &T) -> Result<Bytes, TransferError> {
    let mut raw = Vec::new();
    ciborium::into_writer(event, &mut raw).map_err(|e| TransferError::Encode(e.to_string()))?;
    Ok(Bytes::from(raw))
}

/// Decode a CBOR queue event.
pub fn decode_event<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, TransferError> {
    ciborium::from_reader(payload).map_err(|e| TransferError::Decode(e.to_string()))
}

/// In-process queue: bounded channel plus an offset counter.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<ConsumerMessage>,
    next_offset: Arc<AtomicI64>,
    committed: Arc<AtomicI64>,
}

impl ChannelTransport {
    /// Create a queue with the given channel capacity. Returns the
    /// producer handle and the consumer receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ConsumerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self {
            tx,
            next_offset: Arc::new(AtomicI64::new(0)),
            committed: Arc::new(AtomicI64::new(-1)),
        };
        (transport, rx)
    }

    /// Committer handle for the consumer side.
    pub fn committer(&self) -> ChannelCommitter {
        ChannelCommitter { committed: Arc::clone(&self.committed) }
    }

    /// Highest committed offset, `-1` before the first commit.
    pub fn committed_offset(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MsgProducer for ChannelTransport {
    async fn send(&self, key: &str, payload: Bytes) -> Result<(i32, i64), TransferError> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(ConsumerMessage { key: key.to_owned(), payload, offset })
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        Ok((0, offset))
    }
}

/// Committer half of a [`ChannelTransport`].
#[derive(Clone)]
pub struct ChannelCommitter {
    committed: Arc<AtomicI64>,
}

#[async_trait]
impl OffsetCommitter for ChannelCommitter {
    async fn commit(&self, offset: i64) -> Result<(), TransferError> {
        self.committed.fetch_max(offset, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offsets_are_assigned_in_order() {
        let (transport, mut rx) = ChannelTransport::new(8);
        for i in 0..3u8 {
            let (partition, offset) =
                transport.send("si_1_2", Bytes::from(vec![i])).await.unwrap();
            assert_eq!(partition, 0);
            assert_eq!(offset, i64::from(i));
        }
        for i in 0..3i64 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.offset, i);
            assert_eq!(msg.key, "si_1_2");
        }
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let (transport, _rx) = ChannelTransport::new(8);
        let committer = transport.committer();
        assert_eq!(transport.committed_offset(), -1);

        committer.commit(5).await.unwrap();
        committer.commit(3).await.unwrap();
        assert_eq!(transport.committed_offset(), 5);
    }

    #[test]
    fn test_codec_failures_keep_their_direction() {
        struct Unencodable;
        impl Serialize for Unencodable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("not representable"))
            }
        }

        let err = encode_event(&Unencodable).unwrap_err();
        assert!(matches!(err, TransferError::Encode(_)));

        let err = decode_event::<StoreEvent>(b"\xffgarbage").unwrap_err();
        assert!(matches!(err, TransferError::Decode(_)));
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let event = StoreEvent {
            conversation: ConversationId::new("g_1"),
            records: vec![MessageRecord::placeholder(7)],
            first_seq: 7,
        };
        let raw = encode_event(&event).unwrap();
        let decoded: StoreEvent = decode_event(&raw).unwrap();
        assert_eq!(decoded.first_seq, 7);
        assert_eq!(decoded.records[0].seq, 7);
    }
}
