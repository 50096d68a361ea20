use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::B256;
use alloy_rlp::Decodable;
use inbox_bridge::types::{DelayedInboxMessage, SequencerInboxBatch};
use rollup_primitives::batch::BatchMetadata;
use rollup_primitives::dbkeys::{
    db_key, uint64_to_key, CURRENT_DB_SCHEMA_VERSION, DB_SCHEMA_VERSION_KEY, DELAYED_MESSAGE_COUNT_KEY,
    DELAYED_SEQUENCED_PREFIX, PARENT_CHAIN_BLOCK_NUMBER_PREFIX, RLP_DELAYED_MESSAGE_PREFIX,
    SEQUENCER_BATCH_COUNT_KEY, SEQUENCER_BATCH_META_PREFIX,
};
use rollup_primitives::l1::L1IncomingMessage;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::{Batch, Database};
use crate::error::InboxError;
use crate::multiplexer::{BatchDemultiplexer, DelayedMessageSource};
use crate::streamer::Streamer;
use crate::util::{delete_starting_at, read_count, write_count};

/// Durable, accumulator-checked record of delayed messages and sequencer batches.
/// Every mutation runs under one lock and commits through a single write batch,
/// which the streamer extends with the matching message log update.
pub struct InboxTracker {
    db: Arc<dyn Database>,
    streamer: Arc<dyn Streamer>,
    demux: Arc<dyn BatchDemultiplexer>,
    mutex: Mutex<()>,
}

impl InboxTracker {
    pub fn new(db: Arc<dyn Database>, streamer: Arc<dyn Streamer>, demux: Arc<dyn BatchDemultiplexer>) -> Self {
        Self { db, streamer, demux, mutex: Mutex::new(()) }
    }

    /// Writes zero counters into a fresh database. Existing state is left alone.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let mut batch = self.db.new_batch();
        let mut dirty = false;
        if !self.db.has(DELAYED_MESSAGE_COUNT_KEY)? {
            write_count(batch.as_mut(), DELAYED_MESSAGE_COUNT_KEY, 0)?;
            dirty = true;
        }
        if !self.db.has(SEQUENCER_BATCH_COUNT_KEY)? {
            write_count(batch.as_mut(), SEQUENCER_BATCH_COUNT_KEY, 0)?;
            dirty = true;
        }
        match read_count(self.db.as_ref(), DB_SCHEMA_VERSION_KEY)? {
            None => {
                write_count(batch.as_mut(), DB_SCHEMA_VERSION_KEY, CURRENT_DB_SCHEMA_VERSION)?;
                dirty = true;
            }
            Some(v) if v != CURRENT_DB_SCHEMA_VERSION => {
                anyhow::bail!("unsupported database schema version {v}, expected {CURRENT_DB_SCHEMA_VERSION}");
            }
            Some(_) => {}
        }
        if dirty {
            info!("initialized inbox tracker database");
            batch.write()?;
        }
        Ok(())
    }

    pub fn get_delayed_count(&self) -> anyhow::Result<u64> {
        Ok(read_count(self.db.as_ref(), DELAYED_MESSAGE_COUNT_KEY)?.unwrap_or_default())
    }

    pub fn get_batch_count(&self) -> anyhow::Result<u64> {
        Ok(read_count(self.db.as_ref(), SEQUENCER_BATCH_COUNT_KEY)?.unwrap_or_default())
    }

    fn delayed_entry(&self, seq_num: u64) -> anyhow::Result<Vec<u8>> {
        let data = self.db.get(&db_key(RLP_DELAYED_MESSAGE_PREFIX, seq_num))?.ok_or(InboxError::AccumulatorNotFound)?;
        if data.len() < 32 {
            anyhow::bail!("delayed message {seq_num} entry too short: {} bytes", data.len());
        }
        Ok(data)
    }

    pub fn get_delayed_accumulator(&self, seq_num: u64) -> anyhow::Result<B256> {
        let data = self.delayed_entry(seq_num)?;
        Ok(B256::from_slice(&data[..32]))
    }

    /// The stored message, its accumulator and the parent chain block it was delivered in.
    pub fn get_delayed_message_accumulator_and_parent_chain_block_number(
        &self,
        seq_num: u64,
    ) -> anyhow::Result<(L1IncomingMessage, B256, u64)> {
        let data = self.delayed_entry(seq_num)?;
        let acc = B256::from_slice(&data[..32]);
        let msg = L1IncomingMessage::decode(&mut &data[32..])?;
        let block = match self.db.get(&db_key(PARENT_CHAIN_BLOCK_NUMBER_PREFIX, seq_num))? {
            Some(raw) => {
                let word: [u8; 8] = raw.as_slice().try_into()?;
                u64::from_be_bytes(word)
            }
            None => msg.header.block_number,
        };
        Ok((msg, acc, block))
    }

    pub fn get_delayed_message(&self, seq_num: u64) -> anyhow::Result<L1IncomingMessage> {
        let data = self.delayed_entry(seq_num)?;
        Ok(L1IncomingMessage::decode(&mut &data[32..])?)
    }

    pub fn get_batch_metadata(&self, seq_num: u64) -> anyhow::Result<BatchMetadata> {
        let data = self.db.get(&db_key(SEQUENCER_BATCH_META_PREFIX, seq_num))?.ok_or(InboxError::AccumulatorNotFound)?;
        Ok(BatchMetadata::decode(&mut data.as_slice())?)
    }

    pub fn get_batch_accumulator(&self, seq_num: u64) -> anyhow::Result<B256> {
        Ok(self.get_batch_metadata(seq_num)?.accumulator)
    }

    pub fn get_batch_message_count(&self, seq_num: u64) -> anyhow::Result<u64> {
        Ok(self.get_batch_metadata(seq_num)?.message_count)
    }

    pub fn get_batch_parent_chain_block(&self, seq_num: u64) -> anyhow::Result<u64> {
        Ok(self.get_batch_metadata(seq_num)?.parent_chain_block)
    }

    /// Sequence number of the batch that carries message `pos`, if that batch is tracked.
    pub fn find_inbox_batch_containing_message(&self, pos: u64) -> anyhow::Result<Option<u64>> {
        let batch_count = self.get_batch_count()?;
        if batch_count == 0 || self.get_batch_message_count(batch_count - 1)? <= pos {
            return Ok(None);
        }
        let (mut low, mut high) = (0u64, batch_count - 1);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.get_batch_message_count(mid)? <= pos {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(Some(low))
    }

    fn accumulator_or_none(res: anyhow::Result<B256>) -> anyhow::Result<Option<B256>> {
        match res {
            Ok(acc) => Ok(Some(acc)),
            Err(err) if InboxError::is(&err, |e| matches!(e, InboxError::AccumulatorNotFound)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Appends delayed messages after checking their sequence numbers and accumulator links.
    /// Unless `hard_reorg` is set, a delivery whose last accumulator is already stored is a no-op.
    pub async fn add_delayed_messages(&self, mut messages: Vec<DelayedInboxMessage>, hard_reorg: bool) -> anyhow::Result<()> {
        let Some(first) = messages.first() else { return Ok(()) };
        let _guard = self.mutex.lock().await;
        let mut pos = first.message.header.seq_num()?;

        if !hard_reorg {
            let last_pos = pos + messages.len() as u64 - 1;
            if let Some(have) = Self::accumulator_or_none(self.get_delayed_accumulator(last_pos))? {
                if messages.last().is_some_and(|m| m.after_inbox_acc() == have) {
                    debug!(first = pos, last = last_pos, "delayed messages already present");
                    return Ok(());
                }
            }
        }

        let mut next_acc = B256::ZERO;
        if pos > 0 {
            next_acc = Self::accumulator_or_none(self.get_delayed_accumulator(pos - 1))?
                .ok_or(InboxError::MissingPreviousDelayedMessage(pos - 1))?;
        }
        let mut first_pos = pos;

        let mut batch = self.db.new_batch();
        let mut skipping = true;
        for message in messages.drain(..) {
            let seq_num = message.message.header.seq_num()?;
            if seq_num != pos {
                return Err(InboxError::UnexpectedDelayedSequenceNumber { expected: pos, got: seq_num }.into());
            }
            if next_acc != message.before_inbox_acc {
                return Err(InboxError::DelayedAccumulatorMismatch {
                    seq_num,
                    have: next_acc,
                    claimed: message.before_inbox_acc,
                }
                .into());
            }
            next_acc = message.after_inbox_acc();

            if skipping {
                if Self::accumulator_or_none(self.get_delayed_accumulator(seq_num))? == Some(next_acc) {
                    pos += 1;
                    first_pos += 1;
                    continue;
                }
                skipping = false;
            }

            let mut data = next_acc.to_vec();
            data.extend_from_slice(&alloy_rlp::encode(&message.message));
            batch.put(&db_key(RLP_DELAYED_MESSAGE_PREFIX, seq_num), &data)?;
            batch.put(
                &db_key(PARENT_CHAIN_BLOCK_NUMBER_PREFIX, seq_num),
                &message.parent_chain_block_number.to_be_bytes(),
            )?;
            pos += 1;
        }

        self.set_delayed_count_reorg_and_write_batch(batch, first_pos, pos, true).await
    }

    /// Sets the delayed count to `new_delayed_count`, dropping stored messages past it. Batches
    /// that consumed a delayed message at or after `first_new_delayed_message_pos` are reorged
    /// out together with their messages.
    async fn set_delayed_count_reorg_and_write_batch(
        &self,
        mut batch: Box<dyn Batch>,
        first_new_delayed_message_pos: u64,
        new_delayed_count: u64,
        can_reorg_batches: bool,
    ) -> anyhow::Result<()> {
        if first_new_delayed_message_pos > new_delayed_count {
            anyhow::bail!(
                "first new delayed message position {first_new_delayed_message_pos} is after new delayed count {new_delayed_count}"
            );
        }
        let start = uint64_to_key(new_delayed_count);
        delete_starting_at(self.db.as_ref(), batch.as_mut(), RLP_DELAYED_MESSAGE_PREFIX, &start)?;
        delete_starting_at(self.db.as_ref(), batch.as_mut(), PARENT_CHAIN_BLOCK_NUMBER_PREFIX, &start)?;
        write_count(batch.as_mut(), DELAYED_MESSAGE_COUNT_KEY, new_delayed_count)?;

        let mut reorg_batches_to: Option<u64> = None;
        {
            let mut it = self.db.new_iterator(DELAYED_SEQUENCED_PREFIX, &uint64_to_key(first_new_delayed_message_pos + 1));
            while it.next() {
                let batch_seq_num = u64::decode(&mut it.value())?;
                if !can_reorg_batches {
                    return Err(InboxError::BatchReorgDisabled { batch: batch_seq_num, delayed_count: new_delayed_count }.into());
                }
                batch.delete(it.key())?;
                if reorg_batches_to.is_none() {
                    warn!(
                        delayed_count = new_delayed_count,
                        batch = batch_seq_num,
                        "reorging batches because of delayed messages reorg"
                    );
                    reorg_batches_to = Some(batch_seq_num);
                }
            }
            if let Some(err) = it.error() {
                return Err(err);
            }
            it.release();
        }

        info!(delayed_count = new_delayed_count, "inbox tracker delayed message count");
        match reorg_batches_to {
            Some(count) if self.get_batch_count()? > count => self.reorg_batches_to_impl(batch, count).await,
            _ => batch.write(),
        }
    }

    async fn reorg_batches_to_impl(&self, mut batch: Box<dyn Batch>, count: u64) -> anyhow::Result<()> {
        let prev = if count > 0 {
            match self.get_batch_metadata(count - 1) {
                Ok(meta) => meta,
                Err(err) if InboxError::is(&err, |e| matches!(e, InboxError::AccumulatorNotFound)) => {
                    return Err(InboxError::ReorgToFutureBatchCount { requested: count, current: self.get_batch_count()? }.into());
                }
                Err(err) => return Err(err),
            }
        } else {
            BatchMetadata::default()
        };
        delete_starting_at(
            self.db.as_ref(),
            batch.as_mut(),
            DELAYED_SEQUENCED_PREFIX,
            &uint64_to_key(prev.delayed_message_count + 1),
        )?;
        delete_starting_at(self.db.as_ref(), batch.as_mut(), SEQUENCER_BATCH_META_PREFIX, &uint64_to_key(count))?;
        write_count(batch.as_mut(), SEQUENCER_BATCH_COUNT_KEY, count)?;
        info!(batch_count = count, message_count = prev.message_count, "inbox tracker reorged batches");
        self.streamer.reorg_to_and_end_batch(batch, prev.message_count).await
    }

    /// Rolls the delayed inbox back to `count` messages, cascading into batches when allowed.
    pub async fn reorg_delayed_to(&self, count: u64, can_reorg_batches: bool) -> anyhow::Result<()> {
        let _guard = self.mutex.lock().await;
        let current = self.get_delayed_count()?;
        if count == current {
            return Ok(());
        }
        if count > current {
            return Err(InboxError::ReorgToFutureDelayedCount { requested: count, current }.into());
        }
        self.set_delayed_count_reorg_and_write_batch(self.db.new_batch(), count, count, can_reorg_batches).await
    }

    /// Rolls the batch record back to `count` batches and the message log with it.
    pub async fn reorg_batches_to(&self, count: u64) -> anyhow::Result<()> {
        let _guard = self.mutex.lock().await;
        let current = self.get_batch_count()?;
        if count == current {
            return Ok(());
        }
        if count > current {
            return Err(InboxError::ReorgToFutureBatchCount { requested: count, current }.into());
        }
        self.reorg_batches_to_impl(self.db.new_batch(), count).await
    }

    /// Appends sequencer batches, demultiplexes them into messages and hands those to the
    /// streamer. Batches already stored with the same accumulator are skipped. A batch
    /// whose delayed accumulator does not match local state yields
    /// [`InboxError::DelayedMessagesMismatch`].
    pub async fn add_sequencer_batches(&self, mut batches: Vec<SequencerInboxBatch>) -> anyhow::Result<()> {
        let Some(first) = batches.first() else { return Ok(()) };
        let _guard = self.mutex.lock().await;
        let mut pos = first.sequence_number;

        let mut prev_meta = BatchMetadata::default();
        if pos > 0 {
            prev_meta = match self.get_batch_metadata(pos - 1) {
                Ok(meta) => meta,
                Err(err) if InboxError::is(&err, |e| matches!(e, InboxError::AccumulatorNotFound)) => {
                    return Err(InboxError::MissingPreviousBatch(pos - 1).into());
                }
                Err(err) => return Err(err),
            };
        }
        let mut next_acc = prev_meta.accumulator;

        // Skip the leading run of batches that are already stored unchanged.
        let mut skip = 0;
        for batch in &batches {
            self.check_batch_link(batch, pos, next_acc)?;
            let stored = Self::accumulator_or_none(self.get_batch_accumulator(pos))?;
            if stored != Some(batch.after_inbox_acc) {
                break;
            }
            prev_meta = self.get_batch_metadata(pos)?;
            next_acc = batch.after_inbox_acc;
            pos += 1;
            skip += 1;
        }
        batches.drain(..skip);
        if batches.is_empty() {
            return Ok(());
        }
        for (i, batch) in batches.iter().enumerate() {
            self.check_batch_link(batch, pos + i as u64, next_acc)?;
            next_acc = batch.after_inbox_acc;
        }

        let mut db_batch = self.db.new_batch();
        delete_starting_at(
            self.db.as_ref(),
            db_batch.as_mut(),
            DELAYED_SEQUENCED_PREFIX,
            &uint64_to_key(prev_meta.delayed_message_count + 1),
        )?;

        let tagged = self.demux.demultiplex(&batches, prev_meta.delayed_message_count, self)?;
        let mut message_counts = BTreeMap::new();
        let mut messages = Vec::with_capacity(tagged.len());
        for (i, (seq_num, msg)) in tagged.into_iter().enumerate() {
            message_counts.insert(seq_num, prev_meta.message_count + i as u64 + 1);
            messages.push(msg);
        }

        let mut last_meta = prev_meta;
        for batch in &batches {
            if batch.after_delayed_count < last_meta.delayed_message_count {
                return Err(InboxError::BatchDelayedCountWentBackwards {
                    seq_num: batch.sequence_number,
                    prev: last_meta.delayed_message_count,
                    got: batch.after_delayed_count,
                }
                .into());
            }
            let meta = BatchMetadata {
                accumulator: batch.after_inbox_acc,
                message_count: message_counts.get(&batch.sequence_number).copied().unwrap_or(last_meta.message_count),
                delayed_message_count: batch.after_delayed_count,
                parent_chain_block: batch.parent_chain_block_number,
            };
            db_batch.put(&db_key(SEQUENCER_BATCH_META_PREFIX, batch.sequence_number), &alloy_rlp::encode(meta))?;
            if batch.after_delayed_count > last_meta.delayed_message_count {
                db_batch.put(
                    &db_key(DELAYED_SEQUENCED_PREFIX, batch.after_delayed_count),
                    &alloy_rlp::encode(batch.sequence_number),
                )?;
            }
            last_meta = meta;
        }

        let new_batch_count = pos + batches.len() as u64;
        delete_starting_at(
            self.db.as_ref(),
            db_batch.as_mut(),
            SEQUENCER_BATCH_META_PREFIX,
            &uint64_to_key(new_batch_count),
        )?;
        write_count(db_batch.as_mut(), SEQUENCER_BATCH_COUNT_KEY, new_batch_count)?;

        let first_msg_idx = prev_meta.message_count;
        let broadcast = messages.clone();
        self.streamer.add_messages_and_end_batch(first_msg_idx, true, messages, db_batch).await?;
        info!(
            batch_count = new_batch_count,
            message_count = last_meta.message_count,
            parent_chain_block = last_meta.parent_chain_block,
            "inbox tracker added sequencer batches"
        );

        let threshold = if new_batch_count >= 2 { self.get_batch_message_count(new_batch_count - 2)? } else { 0 };
        self.streamer.broadcast_during_sync(first_msg_idx, &broadcast, threshold);
        Ok(())
    }

    fn check_batch_link(&self, batch: &SequencerInboxBatch, pos: u64, prev_acc: B256) -> anyhow::Result<()> {
        if batch.sequence_number != pos {
            return Err(InboxError::UnexpectedBatchSequenceNumber { expected: pos, got: batch.sequence_number }.into());
        }
        if batch.before_inbox_acc != prev_acc {
            return Err(InboxError::BatchAccumulatorMismatch {
                seq_num: batch.sequence_number,
                have: prev_acc,
                claimed: batch.before_inbox_acc,
            }
            .into());
        }
        if batch.after_delayed_count > 0 {
            let have = Self::accumulator_or_none(self.get_delayed_accumulator(batch.after_delayed_count - 1))?;
            if have != Some(batch.after_delayed_acc) {
                return Err(InboxError::DelayedMessagesMismatch.into());
            }
        }
        Ok(())
    }
}

impl DelayedMessageSource for InboxTracker {
    fn read_delayed_message(&self, seq_num: u64) -> anyhow::Result<L1IncomingMessage> {
        self.get_delayed_message(seq_num)
    }
}
