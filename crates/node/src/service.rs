use std::sync::Arc;

use anyhow::Result;
use inbox_bridge::eth_delayed::EthDelayedBridge;
use inbox_bridge::eth_sequencer::EthSequencerInbox;
use inbox_bridge::header_reader::HttpHeaderReader;
use inbox_bridge::rpc::RpcClient;
use rollup_batch_poster::{BatchPoster, CalldataSubmitter};
use rollup_db_sled::SledDb;
use rollup_inbox::multiplexer::InboxMultiplexerDemux;
use rollup_inbox::tracker::InboxTracker;
use rollup_inbox_reader::InboxReader;
use rollup_seq_coordinator::{RedisStore, SeqCoordinator};
use rollup_streamer::engine::HashChainEngine;
use rollup_streamer::TransactionStreamer;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NodeArgs;

pub struct RollupNode {
    pub args: NodeArgs,
}

impl RollupNode {
    pub fn new(args: NodeArgs) -> Self {
        Self { args }
    }

    /// Runs every component until ctrl-c, then cancels them and waits for each to stop.
    pub async fn start(self) -> Result<()> {
        self.args.validate()?;
        let addresses = self.args.rollup_addresses()?;
        info!(
            bridge = %addresses.bridge,
            sequencer_inbox = %addresses.sequencer_inbox,
            first_block = addresses.deployed_at,
            db = %self.args.db_path.display(),
            "starting rollup node"
        );

        let db = Arc::new(SledDb::open(&self.args.db_path)?);
        let exec = Arc::new(HashChainEngine::new(self.args.block_gas_limit));
        let streamer = Arc::new(TransactionStreamer::new(db.clone(), exec, self.args.streamer_config()));
        let tracker = Arc::new(InboxTracker::new(db, streamer.clone(), Arc::new(InboxMultiplexerDemux)));
        tracker.initialize()?;

        let rpc = Arc::new(RpcClient::new(self.args.parent_chain_url.clone()));
        let header_reader = Arc::new(HttpHeaderReader::new(rpc.clone(), self.args.parent_chain_poll_interval_ms));
        let delayed_bridge = Arc::new(EthDelayedBridge::new(rpc.clone(), addresses.bridge));
        let sequencer_inbox = Arc::new(EthSequencerInbox::new(rpc.clone(), addresses.sequencer_inbox));
        let reader = Arc::new(InboxReader::new(
            tracker.clone(),
            delayed_bridge,
            sequencer_inbox,
            header_reader,
            addresses.deployed_at,
            self.args.inbox_reader_config(),
        )?);

        let cancel = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = vec![
            streamer.clone().start(cancel.clone()),
            reader.clone().start(cancel.clone()),
            mark_synced_when_caught_up(&reader, &streamer, cancel.clone()),
        ];

        let coordinator_config = self.args.coordinator_config();
        if coordinator_config.enable {
            let store = Arc::new(RedisStore::connect(&coordinator_config.redis_url).await?);
            let coordinator = Arc::new(SeqCoordinator::new(store, streamer.clone(), coordinator_config)?);
            streamer.set_coordinator(coordinator.clone());
            tasks.push(coordinator.start(cancel.clone()));
        }

        if self.args.poster_enable {
            let poster_config = self.args.poster_config(&addresses);
            let submitter = Arc::new(CalldataSubmitter::new(rpc, &poster_config));
            let poster = Arc::new(BatchPoster::new(streamer.clone(), tracker.clone(), submitter, poster_config)?);
            tasks.push(poster.start(cancel.clone()));
        }

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        cancel.cancel();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "component task failed");
            }
        }
        Ok(())
    }
}

/// Lets the streamer broadcast freely once the reader first catches up with the parent chain.
fn mark_synced_when_caught_up(
    reader: &InboxReader,
    streamer: &Arc<TransactionStreamer>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut caught_up = reader.caught_up();
    let streamer = streamer.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            ok = async { caught_up.wait_for(|c| *c).await.is_ok() } => {
                if ok {
                    info!("inbox reader caught up");
                    streamer.set_synced(true);
                }
            }
        }
    })
}
