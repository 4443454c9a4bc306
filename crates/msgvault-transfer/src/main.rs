//! Msgvault transfer service binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory backends (development)
//! msgvault-transfer
//!
//! # Durable storage
//! msgvault-transfer --data-dir /var/lib/msgvault
//! ```

use std::path::PathBuf;

use clap::Parser;
use msgvault_cache::{AllocConfig, MemoryKv, MessageCache, SeqAllocator};
use msgvault_model::BucketConfig;
use msgvault_store::{MemoryStores, MsgDocDatabase, MsgDocStore, RedbStores, SeqCounterStore};
use msgvault_transfer::{
    ChannelTransport, MsgTransferPipeline, NopPusher, PipelineQueues, TransferDb,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Msgvault message transfer service
#[derive(Parser, Debug)]
#[command(name = "msgvault-transfer")]
#[command(about = "Msgvault message transfer pipeline")]
#[command(version)]
struct Args {
    /// Data directory for durable storage; in-memory when omitted
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Bucket capacity for direct conversations
    #[arg(long, default_value = "100")]
    direct_capacity: i64,

    /// Bucket capacity for group conversations
    #[arg(long, default_value = "500")]
    group_capacity: i64,

    /// Queue channel capacity
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("msgvault transfer service starting");

    let buckets = BucketConfig { direct: args.direct_capacity, group: args.group_capacity };
    match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join("msgvault.redb");
            tracing::info!("using durable storage at {}", path.display());
            let backend = RedbStores::open(&path)?;
            run(backend, buckets, args.queue_capacity).await
        },
        None => {
            tracing::warn!("no data directory provided - state will not survive a restart");
            run(MemoryStores::new(), buckets, args.queue_capacity).await
        },
    }
}

async fn run<B>(
    backend: B,
    buckets: BucketConfig,
    queue_capacity: usize,
) -> Result<(), Box<dyn std::error::Error>>
where
    B: MsgDocDatabase + SeqCounterStore,
{
    let kv = MemoryKv::new();
    let (inbound_transport, inbound) = ChannelTransport::new(queue_capacity);
    let (store_transport, store) = ChannelTransport::new(queue_capacity);
    let (push_transport, push) = ChannelTransport::new(queue_capacity);

    let db = TransferDb::new(
        SeqAllocator::new(kv.clone(), backend.clone(), AllocConfig::default()),
        MessageCache::new(kv),
        MsgDocStore::new(backend.clone(), backend, buckets),
        store_transport.clone(),
        push_transport.clone(),
    );

    let pipeline = MsgTransferPipeline::spawn(
        db,
        PipelineQueues {
            inbound,
            inbound_committer: inbound_transport.committer(),
            store,
            store_committer: store_transport.committer(),
            push,
            push_committer: push_transport.committer(),
        },
        NopPusher,
        NopPusher,
    );

    tracing::info!("transfer pipeline running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    pipeline.shutdown().await;
    Ok(())
}
