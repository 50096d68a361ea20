use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use alloy_rlp::Decodable;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rollup_inbox::db::{Batch, Database};
use rollup_inbox::streamer::Streamer;
use rollup_inbox::util::{delete_starting_at, read_count, write_count};
use rollup_primitives::dbkeys::{db_key, uint64_to_key, MESSAGE_COUNT_KEY, MESSAGE_PREFIX, MESSAGE_RESULT_PREFIX};
use rollup_primitives::l1::{l2_message_from_txes, L1IncomingMessage, L1IncomingMessageHeader};
use rollup_primitives::message::{MessageResult, MessageWithMetadata};
use tokio::sync::{Mutex, Notify, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ApplyOutcome, ExecEngine};
use crate::hooks::SequencingHooks;
use crate::error::{StreamerError, TxError};

/// Gate consulted before a locally sequenced message is written. The sequencer
/// coordinator implements it; an error means this node may not sequence right now.
#[async_trait]
pub trait SequencingLockout: Send + Sync {
    async fn sequencing_message(&self, pos: u64, msg: &MessageWithMetadata) -> Result<()>;
}

/// Sink for messages that should reach the feed.
pub trait MessageBroadcaster: Send + Sync {
    fn broadcast_messages(&self, first_msg_idx: u64, messages: &[MessageWithMetadata]);
}

impl MessageBroadcaster for tokio::sync::broadcast::Sender<(u64, MessageWithMetadata)> {
    fn broadcast_messages(&self, first_msg_idx: u64, messages: &[MessageWithMetadata]) {
        for (i, msg) in messages.iter().enumerate() {
            // No subscribers is fine.
            let _ = self.send((first_msg_idx + i as u64, msg.clone()));
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Idle wait of the block production loop between checks for new messages.
    pub execute_message_loop_delay: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self { execute_message_loop_delay: Duration::from_millis(100) }
    }
}

/// Whether L1-confirmed messages in `[first_msg_idx, first_msg_idx + msg_count)` should be
/// broadcast while the node is still catching up. Only ranges reaching the threshold are sent.
pub fn should_broadcast_during_sync(synced: bool, first_msg_idx: u64, msg_count: u64, threshold: u64) -> bool {
    if msg_count == 0 {
        return false;
    }
    if synced {
        return true;
    }
    first_msg_idx + msg_count - 1 >= threshold
}

/// Owner of the message log and of block production.
///
/// Lock order is insertion, then block production, then reorg. Appends take the insertion
/// lock; producing a block takes the block production lock and the read side of the reorg
/// lock; truncating the log takes the write side of the reorg lock while holding insertion.
pub struct TransactionStreamer {
    db: Arc<dyn Database>,
    exec: Arc<dyn ExecEngine>,
    config: StreamerConfig,

    insertion_mutex: Mutex<()>,
    block_production_mutex: Mutex<()>,
    reorg_mutex: RwLock<()>,
    reorg_pending: AtomicUsize,
    new_message_notifier: Notify,

    coordinator: StdRwLock<Option<Arc<dyn SequencingLockout>>>,
    broadcaster: StdRwLock<Option<Arc<dyn MessageBroadcaster>>>,
    synced: AtomicBool,
}

struct PendingReorg<'a>(&'a AtomicUsize);

impl Drop for PendingReorg<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransactionStreamer {
    pub fn new(db: Arc<dyn Database>, exec: Arc<dyn ExecEngine>, config: StreamerConfig) -> Self {
        Self {
            db,
            exec,
            config,
            insertion_mutex: Mutex::new(()),
            block_production_mutex: Mutex::new(()),
            reorg_mutex: RwLock::new(()),
            reorg_pending: AtomicUsize::new(0),
            new_message_notifier: Notify::new(),
            coordinator: StdRwLock::new(None),
            broadcaster: StdRwLock::new(None),
            synced: AtomicBool::new(false),
        }
    }

    pub fn set_coordinator(&self, coordinator: Arc<dyn SequencingLockout>) {
        *self.coordinator.write().unwrap_or_else(|p| p.into_inner()) = Some(coordinator);
    }

    pub fn set_broadcaster(&self, broadcaster: Arc<dyn MessageBroadcaster>) {
        *self.broadcaster.write().unwrap_or_else(|p| p.into_inner()) = Some(broadcaster);
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    fn coordinator(&self) -> Option<Arc<dyn SequencingLockout>> {
        self.coordinator.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn broadcast(&self, first_msg_idx: u64, messages: &[MessageWithMetadata]) {
        let broadcaster = self.broadcaster.read().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(b) = broadcaster {
            b.broadcast_messages(first_msg_idx, messages);
        }
    }

    pub fn get_message_count(&self) -> Result<u64> {
        Ok(read_count(self.db.as_ref(), MESSAGE_COUNT_KEY)?.unwrap_or(0))
    }

    fn read_message(&self, idx: u64) -> Result<Option<MessageWithMetadata>> {
        match self.db.get(&db_key(MESSAGE_PREFIX, idx))? {
            Some(data) => Ok(Some(MessageWithMetadata::decode_from(&data)?)),
            None => Ok(None),
        }
    }

    pub fn get_message(&self, idx: u64) -> Result<MessageWithMetadata> {
        self.read_message(idx)?.ok_or_else(|| anyhow!("message {idx} not found"))
    }

    /// Block produced for message `idx`, if production has reached it.
    pub fn result_at_message_index(&self, idx: u64) -> Result<Option<MessageResult>> {
        match self.db.get(&db_key(MESSAGE_RESULT_PREFIX, idx))? {
            Some(data) => Ok(Some(MessageResult::decode(&mut data.as_slice())?)),
            None => Ok(None),
        }
    }

    fn prev_delayed_read(&self, pos: u64) -> Result<u64> {
        if pos == 0 {
            return Ok(0);
        }
        match self.read_message(pos - 1)? {
            Some(prev) => Ok(prev.delayed_messages_read),
            None => Err(StreamerError::MissingPreviousMessage(pos - 1).into()),
        }
    }

    async fn lock_for_reorg(&self) -> (PendingReorg<'_>, RwLockWriteGuard<'_, ()>) {
        self.reorg_pending.fetch_add(1, Ordering::SeqCst);
        let pending = PendingReorg(&self.reorg_pending);
        let guard = self.reorg_mutex.write().await;
        (pending, guard)
    }

    /// Stages the truncation of the log to `count` messages. Requires the reorg write lock.
    async fn reorg_to_internal(&self, batch: &mut dyn Batch, count: u64) -> Result<()> {
        if count == 0 {
            return Err(StreamerError::CannotReorgInitMessage.into());
        }
        let current = self.get_message_count()?;
        if count >= current {
            return Ok(());
        }
        warn!(from = current, to = count, "reorging message log");
        self.exec.reorg_to(count).await?;
        let start = uint64_to_key(count);
        delete_starting_at(self.db.as_ref(), batch, MESSAGE_RESULT_PREFIX, &start)?;
        delete_starting_at(self.db.as_ref(), batch, MESSAGE_PREFIX, &start)?;
        write_count(batch, MESSAGE_COUNT_KEY, count)
    }

    /// Truncates the log to `count` messages.
    pub async fn reorg_to(&self, count: u64) -> Result<()> {
        self.reorg_to_and_end_batch(self.db.new_batch(), count).await
    }

    /// Appends or replays `messages` at `first_msg_idx` in a batch of its own.
    pub async fn add_messages(
        &self,
        first_msg_idx: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadata>,
    ) -> Result<()> {
        let _insertion = self.insertion_mutex.lock().await;
        self.add_messages_and_end_batch_impl(first_msg_idx, messages_are_confirmed, messages, self.db.new_batch())
            .await
    }

    async fn add_messages_and_end_batch_impl(
        &self,
        first_msg_idx: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadata>,
        mut batch: Box<dyn Batch>,
    ) -> Result<()> {
        let mut last_delayed_read = self.prev_delayed_read(first_msg_idx)?;
        for (i, msg) in messages.iter().enumerate() {
            match msg.delayed_messages_read.checked_sub(last_delayed_read) {
                Some(0) | Some(1) => {}
                _ => {
                    return Err(StreamerError::DelayedMessagesReadJump {
                        pos: first_msg_idx + i as u64,
                        from: last_delayed_read,
                        to: msg.delayed_messages_read,
                    }
                    .into())
                }
            }
            last_delayed_read = msg.delayed_messages_read;
        }

        let count = self.get_message_count()?;
        let mut duplicates = 0usize;
        let mut divergence = None;
        while duplicates < messages.len() {
            let pos = first_msg_idx + duplicates as u64;
            if pos >= count {
                break;
            }
            let Some(have) = self.read_message(pos)? else { break };
            let want = &messages[duplicates];
            if have.delayed_messages_read != want.delayed_messages_read
                || !have.message.equals_ignoring_missing_gas_cost(&want.message)
            {
                divergence = Some(pos);
                break;
            }
            if have.message.batch_gas_cost.is_none() && want.message.batch_gas_cost.is_some() {
                batch.put(&db_key(MESSAGE_PREFIX, pos), &want.encode_to_vec())?;
            }
            duplicates += 1;
        }

        let _reorg = match divergence {
            Some(pos) if !messages_are_confirmed => return Err(StreamerError::ReorgNotAllowed { pos }.into()),
            Some(pos) => {
                let locks = self.lock_for_reorg().await;
                self.reorg_to_internal(batch.as_mut(), pos).await?;
                Some(locks)
            }
            None => None,
        };

        let new_messages = &messages[duplicates..];
        let write_from = first_msg_idx + duplicates as u64;
        if !new_messages.is_empty() {
            for (i, msg) in new_messages.iter().enumerate() {
                batch.put(&db_key(MESSAGE_PREFIX, write_from + i as u64), &msg.encode_to_vec())?;
            }
            write_count(batch.as_mut(), MESSAGE_COUNT_KEY, write_from + new_messages.len() as u64)?;
            debug!(first = write_from, count = new_messages.len(), "writing messages");
        }
        batch.write()?;
        if !new_messages.is_empty() {
            self.new_message_notifier.notify_one();
        }
        Ok(())
    }

    /// Spawns the block production loop.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("starting transaction streamer");
            loop {
                let more = match self.execute_next_msg().await {
                    Ok(more) => more,
                    Err(err) => {
                        warn!(error = %err, "error executing message");
                        false
                    }
                };
                if cancel.is_cancelled() {
                    break;
                }
                if more {
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.new_message_notifier.notified() => {}
                    _ = tokio::time::sleep(self.config.execute_message_loop_delay) => {}
                }
            }
            info!("transaction streamer stopped");
        })
    }

    /// Produces the block for the next unconsumed message. Returns whether more remain.
    pub async fn execute_next_msg(&self) -> Result<bool> {
        if self.reorg_pending.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        let Ok(_production) = self.block_production_mutex.try_lock() else { return Ok(false) };
        let Ok(_reorg) = self.reorg_mutex.try_read() else { return Ok(false) };

        let pos = self.exec.head_message_count().await?;
        let count = self.get_message_count()?;
        if pos >= count {
            return Ok(false);
        }
        let msg = self.get_message(pos)?;
        let result = self.exec.digest_message(pos, &msg).await?;
        self.db.put(&db_key(MESSAGE_RESULT_PREFIX, pos), &alloy_rlp::encode(result))?;
        debug!(pos, block_hash = %result.block_hash, "produced block");
        Ok(pos + 1 < count)
    }

    async fn write_sequenced_message(&self, pos: u64, msg: &MessageWithMetadata) -> Result<()> {
        if let Some(coordinator) = self.coordinator() {
            coordinator.sequencing_message(pos, msg).await?;
        }
        let mut batch = self.db.new_batch();
        batch.put(&db_key(MESSAGE_PREFIX, pos), &msg.encode_to_vec())?;
        write_count(batch.as_mut(), MESSAGE_COUNT_KEY, pos + 1)?;
        batch.write()
    }

    /// Builds blocks from locally received transactions and appends one message per block.
    /// Transactions that run out of block gas are carried into the following block. The
    /// returned vector holds one outcome per input transaction.
    pub async fn sequence_transactions(
        &self,
        header: &L1IncomingMessageHeader,
        txes: &[Vec<u8>],
        hooks: &dyn SequencingHooks,
    ) -> Result<Vec<Result<(), TxError>>> {
        let _insertion = self.insertion_mutex.lock().await;
        let _production = self.block_production_mutex.lock().await;
        let _reorg = self.reorg_mutex.read().await;

        let mut pos = self.get_message_count()?;
        let produced = self.exec.head_message_count().await?;
        if produced != pos {
            return Err(StreamerError::ExecutionBehind { produced, messages: pos }.into());
        }
        let delayed_read = self.prev_delayed_read(pos)?;

        let mut outcomes = vec![Err(TxError::ExceedsBlockGasLimit); txes.len()];
        let mut pending: Vec<usize> = (0..txes.len()).collect();
        while !pending.is_empty() {
            let mut block = self.exec.start_block(pos, header, delayed_read).await?;
            let mut included = Vec::new();
            let mut deferred = Vec::new();
            for i in pending {
                let tx = &txes[i];
                if let Err(err) = hooks.pre_tx_filter(tx) {
                    outcomes[i] = Err(err);
                    continue;
                }
                match block.apply(tx) {
                    ApplyOutcome::Applied(result) => match hooks.post_tx_filter(tx, &result) {
                        Ok(()) => included.push(i),
                        Err(err) => {
                            block.revert_last();
                            outcomes[i] = Err(err);
                        }
                    },
                    ApplyOutcome::GasLimitReached => deferred.push(i),
                    ApplyOutcome::Invalid(err) => outcomes[i] = Err(TxError::Invalid(err.to_string())),
                }
            }
            if included.is_empty() {
                // Whatever is left did not fit even an empty block.
                break;
            }

            let msg = MessageWithMetadata {
                message: L1IncomingMessage {
                    header: header.clone(),
                    l2msg: l2_message_from_txes(included.iter().map(|&i| txes[i].as_slice()))?,
                    batch_gas_cost: None,
                },
                delayed_messages_read: delayed_read,
            };
            self.write_sequenced_message(pos, &msg).await?;
            let result = block.commit()?;
            self.db.put(&db_key(MESSAGE_RESULT_PREFIX, pos), &alloy_rlp::encode(result))?;
            for i in included {
                outcomes[i] = Ok(());
            }
            info!(pos, bytes = msg.message.l2msg.len(), block_hash = %result.block_hash, "sequenced block");
            self.broadcast(pos, std::slice::from_ref(&msg));
            pos += 1;
            pending = deferred;
        }
        Ok(outcomes)
    }

    /// Appends delayed messages read by the local delayed sequencer. `first_delayed_seq_num`
    /// must equal the number of delayed messages the log has already consumed.
    pub async fn sequence_delayed_messages(
        &self,
        messages: Vec<L1IncomingMessage>,
        first_delayed_seq_num: u64,
    ) -> Result<()> {
        let _insertion = self.insertion_mutex.lock().await;
        let pos = self.get_message_count()?;
        let delayed_read = self.prev_delayed_read(pos)?;
        if delayed_read != first_delayed_seq_num {
            return Err(StreamerError::DelayedSequenceMismatch { expected: delayed_read, got: first_delayed_seq_num }.into());
        }
        let messages: Vec<MessageWithMetadata> = messages
            .into_iter()
            .enumerate()
            .map(|(i, message)| MessageWithMetadata { message, delayed_messages_read: delayed_read + i as u64 + 1 })
            .collect();
        if let Some(coordinator) = self.coordinator() {
            for (i, msg) in messages.iter().enumerate() {
                coordinator.sequencing_message(pos + i as u64, msg).await?;
            }
        }
        info!(pos, first_delayed_seq_num, count = messages.len(), "sequencing delayed messages");
        self.add_messages_and_end_batch_impl(pos, false, messages.clone(), self.db.new_batch()).await?;
        self.broadcast(pos, &messages);
        Ok(())
    }
}

#[async_trait]
impl Streamer for TransactionStreamer {
    async fn reorg_to_and_end_batch(&self, mut batch: Box<dyn Batch>, count: u64) -> Result<()> {
        let _insertion = self.insertion_mutex.lock().await;
        let _reorg = self.lock_for_reorg().await;
        self.reorg_to_internal(batch.as_mut(), count).await?;
        batch.write()
    }

    async fn add_messages_and_end_batch(
        &self,
        first_msg_idx: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadata>,
        batch: Box<dyn Batch>,
    ) -> Result<()> {
        let _insertion = self.insertion_mutex.lock().await;
        self.add_messages_and_end_batch_impl(first_msg_idx, messages_are_confirmed, messages, batch).await
    }

    fn broadcast_during_sync(&self, first_msg_idx: u64, messages: &[MessageWithMetadata], threshold: u64) {
        let synced = self.synced.load(Ordering::Acquire);
        if should_broadcast_during_sync(synced, first_msg_idx, messages.len() as u64, threshold) {
            self.broadcast(first_msg_idx, messages);
        }
    }
}
