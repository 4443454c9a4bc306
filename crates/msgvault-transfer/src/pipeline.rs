//! The transfer pipeline.
//!
//! Three long-lived consumer tasks:
//!
//! - ingest: takes inbound batches, assigns seqs and writes the message
//!   cache, then fans out one store event and one push event;
//! - store: performs the durable write and evicts the cache;
//! - push: offers stored-or-cached messages to the pushers.
//!
//! Every task commits its queue offset only after its work is durable for
//! its stage, so a crash replays instead of losing messages
//! (at-least-once). All tasks are owned by the returned handle;
//! [`shutdown`](MsgTransferPipeline::shutdown) propagates cancellation
//! through a watch channel and joins them.

use msgvault_cache::{KvCache, SeqWindowCache};
use msgvault_model::{ConversationId, MessageRecord};
use msgvault_store::{MsgDocDatabase, SeqCounterStore};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    database::TransferDb,
    error::TransferError,
    push::{OfflinePusher, OnlinePusher},
    transport::{ConsumerMessage, MsgProducer, OffsetCommitter, PushEvent, StoreEvent, decode_event},
};

/// Consumer ends of the pipeline's three queues.
pub struct PipelineQueues<C1, C2, C3> {
    /// Inbound message batches, keyed by conversation.
    pub inbound: mpsc::Receiver<ConsumerMessage>,
    /// Committer for the inbound queue.
    pub inbound_committer: C1,
    /// Durable-flush events.
    pub store: mpsc::Receiver<ConsumerMessage>,
    /// Committer for the store queue.
    pub store_committer: C2,
    /// Push fan-out events.
    pub push: mpsc::Receiver<ConsumerMessage>,
    /// Committer for the push queue.
    pub push_committer: C3,
}

/// Handle owning the pipeline's tasks.
pub struct MsgTransferPipeline {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MsgTransferPipeline {
    /// Spawn the consumer tasks.
    pub fn spawn<K, S, D, P, C1, C2, C3, On, Off>(
        db: TransferDb<K, S, D, P>,
        queues: PipelineQueues<C1, C2, C3>,
        online_pusher: On,
        offline_pusher: Off,
    ) -> Self
    where
        K: SeqWindowCache + KvCache,
        S: SeqCounterStore,
        D: MsgDocDatabase,
        P: MsgProducer,
        C1: OffsetCommitter,
        C2: OffsetCommitter,
        C3: OffsetCommitter,
        On: OnlinePusher,
        Off: OfflinePusher,
    {
        let (shutdown, _) = watch::channel(false);
        let PipelineQueues { inbound, inbound_committer, store, store_committer, push, push_committer } =
            queues;

        let tasks = vec![
            tokio::spawn(consume(
                "ingest",
                inbound,
                inbound_committer,
                shutdown.subscribe(),
                IngestStage { db: db.clone() },
            )),
            tokio::spawn(consume(
                "store",
                store,
                store_committer,
                shutdown.subscribe(),
                StoreStage { db },
            )),
            tokio::spawn(consume(
                "push",
                push,
                push_committer,
                shutdown.subscribe(),
                PushStage { online_pusher, offline_pusher },
            )),
        ];
        Self { shutdown, tasks }
    }

    /// Stop the consumer tasks and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "pipeline task did not exit cleanly");
            }
        }
        info!("transfer pipeline stopped");
    }
}

/// One pipeline stage: handles a queue message end to end.
trait Stage: Send + Sync + 'static {
    fn handle(
        &self,
        msg: ConsumerMessage,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

/// Shared consumer loop: handle, then commit; never commit on failure.
async fn consume<C: OffsetCommitter>(
    name: &'static str,
    mut queue: mpsc::Receiver<ConsumerMessage>,
    committer: C,
    mut shutdown: watch::Receiver<bool>,
    stage: impl Stage,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            msg = queue.recv() => {
                let Some(msg) = msg else { break };
                let offset = msg.offset;
                match stage.handle(msg).await {
                    Ok(()) => {
                        if let Err(e) = committer.commit(offset).await {
                            warn!(stage = name, offset, error = %e, "offset commit failed");
                        }
                    },
                    // The offset stays uncommitted so the message is
                    // redelivered after a restart.
                    Err(e) => warn!(stage = name, offset, error = %e, "stage failed"),
                }
            },
        }
    }
    debug!(stage = name, "consumer stopped");
}

struct IngestStage<K, S, D, P> {
    db: TransferDb<K, S, D, P>,
}

impl<K, S, D, P> Stage for IngestStage<K, S, D, P>
where
    K: SeqWindowCache + KvCache,
    S: SeqCounterStore,
    D: MsgDocDatabase,
    P: MsgProducer,
{
    async fn handle(&self, msg: ConsumerMessage) -> Result<(), TransferError> {
        let conversation = ConversationId::new(&msg.key);
        let records: Vec<MessageRecord> = decode_event(&msg.payload)?;

        let outcome = self.db.batch_insert_to_cache(&conversation, records).await?;
        if outcome.is_new_conversation {
            info!(conversation_id = %conversation, "first messages for conversation");
        }

        self.db
            .msg_to_store_queue(&conversation, outcome.records.clone(), outcome.first_seq)
            .await?;
        self.db.msg_to_push_queue(&conversation, outcome.records).await?;
        Ok(())
    }
}

struct StoreStage<K, S, D, P> {
    db: TransferDb<K, S, D, P>,
}

impl<K, S, D, P> Stage for StoreStage<K, S, D, P>
where
    K: SeqWindowCache + KvCache,
    S: SeqCounterStore,
    D: MsgDocDatabase,
    P: MsgProducer,
{
    async fn handle(&self, msg: ConsumerMessage) -> Result<(), TransferError> {
        let event: StoreEvent = decode_event(&msg.payload)?;
        self.db
            .batch_insert_to_store(&event.conversation, &event.records, event.first_seq)
            .await
    }
}

struct PushStage<On, Off> {
    online_pusher: On,
    offline_pusher: Off,
}

impl<On, Off> Stage for PushStage<On, Off>
where
    On: OnlinePusher,
    Off: OfflinePusher,
{
    async fn handle(&self, msg: ConsumerMessage) -> Result<(), TransferError> {
        let event: PushEvent = decode_event(&msg.payload)?;
        for record in &event.records {
            self.online_pusher.push_online(&event.conversation, record).await?;
            if !record.at_user_ids.is_empty() {
                self.offline_pusher.push_offline(&record.at_user_ids, record).await?;
            }
        }
        Ok(())
    }
}
