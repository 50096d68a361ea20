use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::B256;
use anyhow::Result;
use inbox_bridge::traits::{DelayedBridge, L1Header, L1HeaderReader, SequencerInbox};
use inbox_bridge::types::{DelayedInboxMessage, SequencerInboxBatch};
use rollup_inbox::tracker::InboxTracker;
use rollup_inbox::InboxError;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{InboxReaderConfig, ReadMode};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("can't get older messages than parent chain block {0}")]
    NoOlderMessages(u64),
    #[error("only {have} {kind} stored after reading to parent chain block {height}, chain reports {expected}")]
    MessagesMissing { kind: &'static str, have: u64, expected: u64, height: u64 },
    #[error("chain reports {remote} delayed messages but {local} are stored and hard reorg is disabled")]
    DelayedAhead { local: u64, remote: u64 },
    #[error("chain reports {remote} sequencer batches but {local} are stored and hard reorg is disabled")]
    BatchesAhead { local: u64, remote: u64 },
}

/// Outcome of comparing local counts and boundary accumulators against the chain.
#[derive(Clone, Copy, Debug, Default)]
struct Reconcile {
    remote_delayed: u64,
    remote_batches: u64,
    missing_delayed: bool,
    reorging_delayed: bool,
    missing_batches: bool,
    reorging_batches: bool,
}

impl Reconcile {
    fn in_sync(&self) -> bool {
        !(self.missing_delayed || self.reorging_delayed || self.missing_batches || self.reorging_batches)
    }
}

/// Next read window size given how many events the last window produced.
pub fn next_blocks_to_fetch(current: u64, events_read: u64, config: &InboxReaderConfig) -> u64 {
    if events_read > config.target_messages_read {
        (current / 2).max(config.min_blocks_to_read)
    } else if events_read < config.target_messages_read {
        current.saturating_add(current.div_ceil(2)).min(config.max_blocks_to_read)
    } else {
        current
    }
}

/// Keeps the tracker's delayed messages and batches in step with the parent chain.
pub struct InboxReader {
    tracker: Arc<InboxTracker>,
    delayed_bridge: Arc<dyn DelayedBridge>,
    sequencer_inbox: Arc<dyn SequencerInbox>,
    l1_reader: Arc<dyn L1HeaderReader>,
    first_message_block: u64,
    config: InboxReaderConfig,
    caught_up: watch::Sender<bool>,
    last_seen_batch_count: AtomicU64,
    last_read_batch_count: AtomicU64,
}

impl InboxReader {
    pub fn new(
        tracker: Arc<InboxTracker>,
        delayed_bridge: Arc<dyn DelayedBridge>,
        sequencer_inbox: Arc<dyn SequencerInbox>,
        l1_reader: Arc<dyn L1HeaderReader>,
        first_message_block: u64,
        config: InboxReaderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (caught_up, _) = watch::channel(false);
        Ok(Self {
            tracker,
            delayed_bridge,
            sequencer_inbox,
            l1_reader,
            first_message_block,
            config,
            caught_up,
            last_seen_batch_count: AtomicU64::new(0),
            last_read_batch_count: AtomicU64::new(0),
        })
    }

    /// Flips to `true` the first time local state matches the chain.
    pub fn caught_up(&self) -> watch::Receiver<bool> {
        self.caught_up.subscribe()
    }

    pub fn tracker(&self) -> &Arc<InboxTracker> {
        &self.tracker
    }

    pub fn get_last_read_batch_count(&self) -> u64 {
        self.last_read_batch_count.load(Ordering::Relaxed)
    }

    pub fn get_last_seen_batch_count(&self) -> u64 {
        self.last_seen_batch_count.load(Ordering::Relaxed)
    }

    pub fn get_delay_blocks(&self) -> u64 {
        self.config.delay_blocks
    }

    fn recent_parent_chain_block_to_msg(&self, parent_chain_block: u64) -> Result<u64> {
        let mut batch = self.tracker.get_batch_count()?;
        while batch > 0 {
            batch -= 1;
            let meta = self.tracker.get_batch_metadata(batch)?;
            if meta.parent_chain_block <= parent_chain_block {
                return Ok(meta.message_count);
            }
        }
        Ok(0)
    }

    /// Messages carried by batches posted at or before the parent chain's safe block.
    pub async fn get_safe_msg_count(&self) -> Result<u64> {
        let l1block = self.l1_reader.latest_safe_block_nr().await?;
        self.recent_parent_chain_block_to_msg(l1block)
    }

    pub async fn get_finalized_msg_count(&self) -> Result<u64> {
        let l1block = self.l1_reader.latest_finalized_block_nr().await?;
        self.recent_parent_chain_block_to_msg(l1block)
    }

    /// Spawns the polling loop. Errors abort the current cycle, which restarts after `check_delay`.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(first_message_block = self.first_message_block, "inbox reader starting");
            let (mut heads, unsubscribe) = self.l1_reader.subscribe().await;
            loop {
                if let Err(err) = self.run(&mut heads, &cancel).await {
                    warn!(error = %err, "error reading inbox");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.check_delay) => {}
                }
            }
            unsubscribe();
            info!("inbox reader stopped");
        })
    }

    async fn run(&self, heads: &mut Receiver<L1Header>, cancel: &CancellationToken) -> Result<()> {
        let mut from = self.next_block_to_read()?;
        let mut blocks_to_fetch = self.config.default_blocks_to_read;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let height = self.current_height().await?;
            let state = self.reconcile_counts(height).await?;
            self.last_seen_batch_count.store(state.remote_batches, Ordering::Relaxed);

            if state.in_sync() {
                from = from.max(height + 1);
                self.last_read_batch_count.store(state.remote_batches, Ordering::Relaxed);
                if !*self.caught_up.borrow() {
                    info!(height, batches = state.remote_batches, delayed = state.remote_delayed, "inbox reader caught up");
                    self.caught_up.send_replace(true);
                }
            } else {
                debug!(from, height, ?state, "reading inbox");
                self.read_to_height(from.min(height), &mut blocks_to_fetch, height, state).await?;
                from = height + 1;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(_) = heads.recv() => {}
                _ = tokio::time::sleep(self.config.check_delay) => {}
            }
        }
    }

    async fn current_height(&self) -> Result<u64> {
        Ok(match self.config.read_mode {
            ReadMode::Latest => self.l1_reader.last_header().await?.number.saturating_sub(self.config.delay_blocks),
            ReadMode::Safe => self.l1_reader.latest_safe_block_nr().await?,
            ReadMode::Finalized => self.l1_reader.latest_finalized_block_nr().await?,
        })
    }

    /// Earliest parent chain block that can still hold messages we have not stored.
    fn next_block_to_read(&self) -> Result<u64> {
        let delayed_count = self.tracker.get_delayed_count()?;
        let batch_count = self.tracker.get_batch_count()?;
        if delayed_count == 0 || batch_count == 0 {
            return Ok(self.first_message_block);
        }
        let (_, _, delayed_block) =
            self.tracker.get_delayed_message_accumulator_and_parent_chain_block_number(delayed_count - 1)?;
        let batch_block = self.tracker.get_batch_parent_chain_block(batch_count - 1)?;
        Ok(delayed_block.min(batch_block).max(self.first_message_block))
    }

    fn prev_block_for_reorg(&self, from: u64, step_back: u64) -> Result<u64> {
        if from <= self.first_message_block {
            return Err(ReaderError::NoOlderMessages(self.first_message_block).into());
        }
        Ok(from.saturating_sub(step_back).max(self.first_message_block))
    }

    /// Compares counts and the accumulator at the last stored index. Equal counts are not
    /// enough: content can change without changing length.
    async fn reconcile_counts(&self, height: u64) -> Result<Reconcile> {
        let remote_delayed = self.delayed_bridge.get_message_count(height).await?;
        let mut local_delayed = self.tracker.get_delayed_count()?;
        if local_delayed > remote_delayed {
            if !self.config.hard_reorg {
                return Err(ReaderError::DelayedAhead { local: local_delayed, remote: remote_delayed }.into());
            }
            warn!(local = local_delayed, remote = remote_delayed, "backwards reorg of delayed messages");
            self.tracker.reorg_delayed_to(remote_delayed, true).await?;
            local_delayed = remote_delayed;
        }
        let reorging_delayed = local_delayed > 0
            && self.tracker.get_delayed_accumulator(local_delayed - 1)?
                != self.delayed_bridge.get_accumulator(local_delayed - 1, height).await?;

        let remote_batches = self.sequencer_inbox.get_batch_count(height).await?;
        let mut local_batches = self.tracker.get_batch_count()?;
        if local_batches > remote_batches {
            if !self.config.hard_reorg {
                return Err(ReaderError::BatchesAhead { local: local_batches, remote: remote_batches }.into());
            }
            warn!(local = local_batches, remote = remote_batches, "backwards reorg of sequencer batches");
            self.tracker.reorg_batches_to(remote_batches).await?;
            local_batches = remote_batches;
        }
        let reorging_batches = local_batches > 0
            && self.tracker.get_batch_accumulator(local_batches - 1)?
                != self.sequencer_inbox.get_accumulator(local_batches - 1, height).await?;

        Ok(Reconcile {
            remote_delayed,
            remote_batches,
            missing_delayed: local_delayed < remote_delayed,
            reorging_delayed,
            missing_batches: local_batches < remote_batches,
            reorging_batches,
        })
    }

    fn accumulator_links(stored: Result<B256>, claimed: B256) -> Result<bool> {
        match stored {
            Ok(acc) => Ok(acc == claimed),
            Err(err) if InboxError::is(&err, |e| matches!(e, InboxError::AccumulatorNotFound)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn delayed_links(&self, first: &DelayedInboxMessage) -> Result<bool> {
        let seq = first.message.header.seq_num()?;
        if seq == 0 {
            return Ok(first.before_inbox_acc == B256::ZERO);
        }
        Self::accumulator_links(self.tracker.get_delayed_accumulator(seq - 1), first.before_inbox_acc)
    }

    fn batch_links(&self, first: &SequencerInboxBatch) -> Result<bool> {
        if first.sequence_number == 0 {
            return Ok(first.before_inbox_acc == B256::ZERO);
        }
        Self::accumulator_links(self.tracker.get_batch_accumulator(first.sequence_number - 1), first.before_inbox_acc)
    }

    /// Reads `[from, height]` window by window, stepping back while the first events read do
    /// not link onto stored accumulators.
    async fn read_to_height(&self, mut from: u64, blocks_to_fetch: &mut u64, height: u64, state: Reconcile) -> Result<()> {
        let mut reorging_delayed = state.reorging_delayed;
        let mut reorging_batches = state.reorging_batches;
        let mut step_back = self.config.reorg_step_back_blocks;
        loop {
            let to = from.saturating_add(*blocks_to_fetch - 1).min(height);
            let delayed = self.delayed_bridge.lookup_messages_in_range(from, to).await?;
            let batches = self.sequencer_inbox.lookup_batches_in_range(from, to).await?;

            if let Some(first) = delayed.first() {
                reorging_delayed = !self.delayed_links(first)?;
            }
            if let Some(first) = batches.first() {
                reorging_batches = !self.batch_links(first)?;
            }
            if reorging_delayed || reorging_batches {
                let prev = self.prev_block_for_reorg(from, step_back)?;
                warn!(from, to = prev, reorging_delayed, reorging_batches, "inbox reorg detected, stepping back");
                from = prev;
                step_back = step_back.saturating_mul(2);
                continue;
            }

            let events_read = (delayed.len() + batches.len()) as u64;
            if !delayed.is_empty() {
                self.tracker.add_delayed_messages(delayed, self.config.hard_reorg).await?;
            }
            if !batches.is_empty() {
                if let Err(err) = self.tracker.add_sequencer_batches(batches).await {
                    if !InboxError::is(&err, |e| matches!(e, InboxError::DelayedMessagesMismatch)) {
                        return Err(err);
                    }
                    let prev = self.prev_block_for_reorg(from, step_back)?;
                    warn!(from, to = prev, "sequencer batch references unknown delayed messages, rescanning");
                    from = prev;
                    step_back = step_back.saturating_mul(2);
                    continue;
                }
            }
            step_back = self.config.reorg_step_back_blocks;
            self.last_read_batch_count.store(self.tracker.get_batch_count()?, Ordering::Relaxed);
            *blocks_to_fetch = next_blocks_to_fetch(*blocks_to_fetch, events_read, &self.config);

            if to >= height {
                break;
            }
            from = to + 1;
        }

        let delayed = self.tracker.get_delayed_count()?;
        if delayed < state.remote_delayed {
            return Err(ReaderError::MessagesMissing { kind: "delayed messages", have: delayed, expected: state.remote_delayed, height }.into());
        }
        let batches = self.tracker.get_batch_count()?;
        if batches < state.remote_batches {
            return Err(ReaderError::MessagesMissing { kind: "sequencer batches", have: batches, expected: state.remote_batches, height }.into());
        }
        Ok(())
    }
}
