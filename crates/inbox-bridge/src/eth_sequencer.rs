use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::abi::{self, selector, topic};
use crate::rpc::{BlockTag, RpcClient, RpcLog};
use crate::selectors::{
    BATCH_DATA_LOCATION_BLOB, BATCH_DATA_LOCATION_NO_DATA, BATCH_DATA_LOCATION_SEPARATE_EVENT,
    BATCH_DATA_LOCATION_TX_INPUT, EVT_SEQUENCER_BATCH_DATA, EVT_SEQUENCER_BATCH_DELIVERED,
    SIG_ADD_SEQUENCER_L2_BATCH_FROM_ORIGIN, SIG_BATCH_COUNT, SIG_INBOX_ACCS,
};
use crate::traits::SequencerInbox;
use crate::types::{SequencerInboxBatch, TimeBounds};

/// Decodes a `SequencerBatchDelivered` log. `serialized` is left empty.
pub fn parse_batch_delivered(lg: &RpcLog) -> anyhow::Result<SequencerInboxBatch> {
    if lg.topics.first() != Some(&topic(EVT_SEQUENCER_BATCH_DELIVERED)) {
        anyhow::bail!("log is not a SequencerBatchDelivered event");
    }
    if lg.topics.len() < 4 {
        anyhow::bail!("SequencerBatchDelivered with {} topics", lg.topics.len());
    }
    let data = lg.data.as_ref();
    let data_location = u8::try_from(abi::word_u64(data, 6)?).map_err(|_| anyhow::anyhow!("bad data location"))?;
    Ok(SequencerInboxBatch {
        sequence_number: abi::topic_u64(&lg.topics, 1)?,
        before_inbox_acc: lg.topics[2],
        after_inbox_acc: lg.topics[3],
        after_delayed_acc: abi::word_b256(data, 0)?,
        after_delayed_count: abi::word_u64(data, 1)?,
        time_bounds: TimeBounds {
            min_timestamp: abi::word_u64(data, 2)?,
            max_timestamp: abi::word_u64(data, 3)?,
            min_block_number: abi::word_u64(data, 4)?,
            max_block_number: abi::word_u64(data, 5)?,
        },
        data_location,
        bridge_address: lg.address,
        parent_chain_block_number: lg.block_number.ok_or_else(|| anyhow::anyhow!("pending batch log"))?,
        block_hash: lg.block_hash.unwrap_or_default(),
        tx_hash: lg.transaction_hash.unwrap_or_default(),
        serialized: Vec::new(),
    })
}

pub struct EthSequencerInbox {
    rpc: Arc<RpcClient>,
    inbox_addr: Address,
}

impl EthSequencerInbox {
    pub fn new(rpc: Arc<RpcClient>, inbox_addr: Address) -> Self {
        Self { rpc, inbox_addr }
    }

    async fn separate_event_payload(&self, batch: &SequencerInboxBatch) -> anyhow::Result<Vec<u8>> {
        let seq_topic = B256::from(U256::from(batch.sequence_number));
        let logs = self
            .rpc
            .get_logs(
                &[self.inbox_addr],
                batch.parent_chain_block_number,
                batch.parent_chain_block_number,
                vec![vec![topic(EVT_SEQUENCER_BATCH_DATA)], vec![seq_topic]],
            )
            .await?;
        match logs.as_slice() {
            [lg] => abi::dynamic_bytes(lg.data.as_ref(), 0),
            other => anyhow::bail!(
                "expected 1 SequencerBatchData log for batch {} at block {}, got {}",
                batch.sequence_number,
                batch.parent_chain_block_number,
                other.len()
            ),
        }
    }

    async fn tx_input_payload(&self, batch: &SequencerInboxBatch) -> anyhow::Result<Vec<u8>> {
        let input = self.rpc.transaction_input(batch.tx_hash).await?;
        match input.split_first_chunk::<4>() {
            Some((sel, args)) if *sel == selector(SIG_ADD_SEQUENCER_L2_BATCH_FROM_ORIGIN) => abi::dynamic_bytes(args, 1),
            _ => anyhow::bail!("batch {} posted by unexpected call in tx {}", batch.sequence_number, batch.tx_hash),
        }
    }

    async fn payload(&self, batch: &SequencerInboxBatch) -> anyhow::Result<Vec<u8>> {
        match batch.data_location {
            BATCH_DATA_LOCATION_TX_INPUT => self.tx_input_payload(batch).await,
            BATCH_DATA_LOCATION_SEPARATE_EVENT => self.separate_event_payload(batch).await,
            BATCH_DATA_LOCATION_NO_DATA => Ok(Vec::new()),
            BATCH_DATA_LOCATION_BLOB => anyhow::bail!("batch {} is posted in blobs, which are not supported", batch.sequence_number),
            other => anyhow::bail!("batch {} has unknown data location {other}", batch.sequence_number),
        }
    }
}

#[async_trait]
impl SequencerInbox for EthSequencerInbox {
    async fn get_batch_count(&self, block_number: u64) -> anyhow::Result<u64> {
        let res = self.rpc.eth_call(self.inbox_addr, &selector(SIG_BATCH_COUNT), BlockTag::Number(block_number)).await?;
        abi::word_u64(&res, 0)
    }

    async fn get_accumulator(&self, seq_num: u64, block_number: u64) -> anyhow::Result<B256> {
        let data = abi::CallEncoder::default().uint(seq_num).encode(SIG_INBOX_ACCS);
        let res = self.rpc.eth_call(self.inbox_addr, &data, BlockTag::Number(block_number)).await?;
        abi::word_b256(&res, 0)
    }

    async fn lookup_batches_in_range(&self, from_block: u64, to_block: u64) -> anyhow::Result<Vec<SequencerInboxBatch>> {
        let logs = self
            .rpc
            .get_logs(&[self.inbox_addr], from_block, to_block, vec![vec![topic(EVT_SEQUENCER_BATCH_DELIVERED)]])
            .await?;
        let mut out: Vec<SequencerInboxBatch> = Vec::with_capacity(logs.len());
        for lg in &logs {
            let mut batch = parse_batch_delivered(lg)?;
            if let Some(prev) = out.last() {
                if batch.sequence_number != prev.sequence_number + 1 {
                    anyhow::bail!("sequencer batches out of order: after {} got {}", prev.sequence_number, batch.sequence_number);
                }
            }
            let payload = self.payload(&batch).await?;
            batch.set_payload(&payload);
            debug!(seq = batch.sequence_number, len = batch.serialized.len(), "fetched sequencer batch");
            out.push(batch);
        }
        if !out.is_empty() {
            info!(from_block, to_block, count = out.len(), "looked up sequencer batches");
        }
        Ok(out)
    }
}
