//! Message transfer pipeline for the msgvault core.
//!
//! Inbound message batches flow through three stages: seq assignment plus
//! cache write, durable flush to the document store, and push fan-out.
//! Queue offsets are committed only after each stage's work is durable,
//! giving at-least-once delivery end to end.
//!
//! The queue and push seams are traits ([`MsgProducer`],
//! [`OffsetCommitter`], [`OnlinePusher`], [`OfflinePusher`]);
//! [`ChannelTransport`] and [`NopPusher`] are the in-process
//! implementations used by tests and the demo binary.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod database;
mod error;
mod pipeline;
mod push;
mod transport;

pub use database::{CacheInsertOutcome, TransferDb};
pub use error::TransferError;
pub use pipeline::{MsgTransferPipeline, PipelineQueues};
pub use push::{NopPusher, OfflinePusher, OnlinePusher};
pub use transport::{
    ChannelCommitter, ChannelTransport, ConsumerMessage, MsgProducer, OffsetCommitter, PushEvent,
    StoreEvent, decode_event, encode_event,
};
