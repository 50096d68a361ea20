use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use inbox_bridge::abi::CallEncoder;
use inbox_bridge::rpc::RpcClient;
use inbox_bridge::selectors::SIG_ADD_SEQUENCER_L2_BATCH_FROM_ORIGIN;
use rollup_inbox::tracker::InboxTracker;
use rollup_streamer::TransactionStreamer;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BatchPosterConfig;
use crate::segments::{BatchSegments, SegmentsError};

/// Where the next batch starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchPosterPosition {
    pub message_count: u64,
    pub delayed_message_count: u64,
    pub next_seq_num: u64,
}

/// A batch ready for the sequencer inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostedBatch {
    pub seq_num: u64,
    pub data: Vec<u8>,
    pub after_delayed_messages_read: u64,
    pub prev_message_count: u64,
    pub new_message_count: u64,
}

#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    async fn submit(&self, batch: &PostedBatch) -> Result<B256>;
}

/// Posts batches as `addSequencerL2BatchFromOrigin` calldata.
pub struct CalldataSubmitter {
    rpc: Arc<RpcClient>,
    from: Address,
    sequencer_inbox: Address,
    gas_refunder: Address,
}

impl CalldataSubmitter {
    pub fn new(rpc: Arc<RpcClient>, config: &BatchPosterConfig) -> Self {
        Self { rpc, from: config.from, sequencer_inbox: config.sequencer_inbox, gas_refunder: config.gas_refunder }
    }

    pub fn encode_add_batch(&self, batch: &PostedBatch) -> Vec<u8> {
        encode_add_batch(batch, self.gas_refunder)
    }
}

pub fn encode_add_batch(batch: &PostedBatch, gas_refunder: Address) -> Vec<u8> {
    CallEncoder::default()
        .uint(batch.seq_num)
        .bytes(&batch.data)
        .uint(batch.after_delayed_messages_read)
        .address(gas_refunder)
        .uint(batch.prev_message_count)
        .uint(batch.new_message_count)
        .encode(SIG_ADD_SEQUENCER_L2_BATCH_FROM_ORIGIN)
}

#[async_trait]
impl BatchSubmitter for CalldataSubmitter {
    async fn submit(&self, batch: &PostedBatch) -> Result<B256> {
        let data = self.encode_add_batch(batch);
        self.rpc.send_transaction(self.from, self.sequencer_inbox, &data).await
    }
}

pub struct BatchPoster {
    streamer: Arc<TransactionStreamer>,
    tracker: Arc<InboxTracker>,
    submitter: Arc<dyn BatchSubmitter>,
    config: BatchPosterConfig,
    /// Set after our own post, ahead of the tracker until the inbox reader sees it.
    position: Mutex<Option<BatchPosterPosition>>,
    backlog: AtomicU64,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

impl BatchPoster {
    pub fn new(
        streamer: Arc<TransactionStreamer>,
        tracker: Arc<InboxTracker>,
        submitter: Arc<dyn BatchSubmitter>,
        config: BatchPosterConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { streamer, tracker, submitter, config, position: Mutex::new(None), backlog: AtomicU64::new(0) })
    }

    /// Estimated number of full batches still waiting to be posted.
    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::Relaxed)
    }

    fn tracked_position(&self) -> Result<BatchPosterPosition> {
        let batch_count = self.tracker.get_batch_count()?;
        if batch_count == 0 {
            return Ok(BatchPosterPosition::default());
        }
        let meta = self.tracker.get_batch_metadata(batch_count - 1)?;
        Ok(BatchPosterPosition {
            message_count: meta.message_count,
            delayed_message_count: meta.delayed_message_count,
            next_seq_num: batch_count,
        })
    }

    fn segments_error(&self, pos: &BatchPosterPosition, err: SegmentsError) -> anyhow::Error {
        if let SegmentsError::MessageTooLarge { size, limit } = &err {
            error!(
                message = pos.message_count,
                seq_num = pos.next_seq_num,
                size,
                limit,
                max_size = self.config.max_size,
                "message cannot fit in any batch, raise max-size to resume posting"
            );
        }
        err.into()
    }

    /// Builds the next batch from `pos`. Returns `None` when there is nothing to post yet:
    /// either no new messages, or a partial batch younger than `max_delay`.
    pub async fn build_batch(&self, pos: &BatchPosterPosition, now: u64) -> Result<Option<PostedBatch>> {
        let msg_count = self.streamer.get_message_count()?;
        if msg_count <= pos.message_count {
            return Ok(None);
        }
        let (level, recompression_level) = self.config.compression_levels.select(self.backlog());
        let mut segments = BatchSegments::new(
            self.config.payload_size_limit(),
            pos.delayed_message_count,
            level,
            recompression_level,
        )?;

        let mut first_timestamp = None;
        for idx in pos.message_count..msg_count {
            let msg = self.streamer.get_message(idx)?;
            first_timestamp.get_or_insert(msg.message.header.timestamp);
            if !segments.add_message(&msg).map_err(|err| self.segments_error(pos, err))? {
                break;
            }
        }
        let full = segments.is_done();
        let sealed = segments.close_and_get_bytes().map_err(|err| self.segments_error(pos, err))?;
        let Some(sealed) = sealed else { return Ok(None) };

        let new_message_count = pos.message_count + sealed.message_count;
        let remaining = msg_count - new_message_count;
        let backlog = if full { remaining / sealed.message_count.max(1) } else { 0 };
        self.backlog.store(backlog, Ordering::Relaxed);

        let age = now.saturating_sub(first_timestamp.unwrap_or(now));
        if !full && age < self.config.max_delay.as_secs() {
            debug!(messages = sealed.message_count, age, "waiting for a fuller batch");
            return Ok(None);
        }
        Ok(Some(PostedBatch {
            seq_num: pos.next_seq_num,
            data: sealed.data,
            after_delayed_messages_read: sealed.delayed_messages_read,
            prev_message_count: pos.message_count,
            new_message_count,
        }))
    }

    /// Posts at most one batch. Returns the submission hash when a batch went out.
    pub async fn post_once(&self, now: u64) -> Result<Option<B256>> {
        let mut position = self.position.lock().await;
        let tracked = self.tracked_position()?;
        let pos = match *position {
            Some(ours) if ours.next_seq_num >= tracked.next_seq_num => ours,
            _ => tracked,
        };
        let Some(batch) = self.build_batch(&pos, now).await? else {
            *position = Some(pos);
            return Ok(None);
        };
        let tx = self.submitter.submit(&batch).await?;
        info!(
            seq_num = batch.seq_num,
            from = batch.prev_message_count,
            to = batch.new_message_count,
            delayed = batch.after_delayed_messages_read,
            size = batch.data.len(),
            backlog = self.backlog(),
            %tx,
            "posted batch"
        );
        *position = Some(BatchPosterPosition {
            message_count: batch.new_message_count,
            delayed_message_count: batch.after_delayed_messages_read,
            next_seq_num: batch.seq_num + 1,
        });
        Ok(Some(tx))
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(max_size = self.config.max_size, "starting batch poster");
            loop {
                let delay = match self.post_once(unix_now()).await {
                    // A full backlog posts again without waiting.
                    Ok(Some(_)) if self.backlog() > 0 => std::time::Duration::ZERO,
                    Ok(_) => self.config.poll_interval,
                    Err(err) => {
                        warn!(%err, "error posting batch");
                        self.config.error_delay
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!("batch poster stopped");
        })
    }
}
