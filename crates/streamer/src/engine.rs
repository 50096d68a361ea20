use std::sync::Mutex;

use alloy_primitives::{keccak256, B256};
use anyhow::Result;
use async_trait::async_trait;
use rollup_primitives::accumulator::hash_after;
use rollup_primitives::l1::{l2_message_from_txes, L1IncomingMessageHeader};
use rollup_primitives::message::{MessageResult, MessageWithMetadata};

/// Receipt-level facts the sequencing filters look at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxResult {
    pub gas_used: u64,
    pub reverted: bool,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    Applied(TxResult),
    /// The block has no room left for this transaction; it can go into the next one.
    GasLimitReached,
    Invalid(anyhow::Error),
}

/// A block under construction on top of the current head. Dropping it discards the block.
pub trait BlockBuilder: Send {
    fn apply(&mut self, tx: &[u8]) -> ApplyOutcome;
    /// Undoes the most recent successful [`BlockBuilder::apply`].
    fn revert_last(&mut self);
    /// Number of transactions currently in the block.
    fn tx_count(&self) -> usize;
    /// Makes the block the new head.
    fn commit(self: Box<Self>) -> Result<MessageResult>;
}

/// Execution client. Blocks are a function of the message log: block `n` is the result of
/// replaying message `n` on top of block `n - 1`.
#[async_trait]
pub trait ExecEngine: Send + Sync {
    /// Number of messages that have a block.
    async fn head_message_count(&self) -> Result<u64>;
    /// Replays message `msg_idx` on the head, which must be block `msg_idx - 1`.
    async fn digest_message(&self, msg_idx: u64, msg: &MessageWithMetadata) -> Result<MessageResult>;
    /// Opens a block for message `msg_idx` built from locally sequenced transactions.
    async fn start_block(
        &self,
        msg_idx: u64,
        header: &L1IncomingMessageHeader,
        delayed_messages_read: u64,
    ) -> Result<Box<dyn BlockBuilder>>;
    /// Drops every block from message `count` on.
    async fn reorg_to(&self, count: u64) -> Result<()>;
}

/// Execution stand-in whose block hashes chain the replayed messages. Transactions are
/// charged a fixed intrinsic cost plus calldata; an empty transaction is invalid.
pub struct HashChainEngine {
    block_gas_limit: u64,
    blocks: std::sync::Arc<Mutex<Vec<MessageResult>>>,
}

pub const INTRINSIC_GAS: u64 = 21_000;
pub const CALLDATA_GAS_PER_BYTE: u64 = 16;

pub fn tx_gas(tx: &[u8]) -> u64 {
    INTRINSIC_GAS + CALLDATA_GAS_PER_BYTE * tx.len() as u64
}

impl HashChainEngine {
    pub fn new(block_gas_limit: u64) -> Self {
        Self { block_gas_limit, blocks: Default::default() }
    }

    pub fn block_hashes(&self) -> Vec<B256> {
        self.lock_blocks().iter().map(|r| r.block_hash).collect()
    }

    fn lock_blocks(&self) -> std::sync::MutexGuard<'_, Vec<MessageResult>> {
        self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_result(prev: Option<&MessageResult>, msg: &MessageWithMetadata) -> MessageResult {
        let parent = prev.map(|r| r.block_hash).unwrap_or_default();
        MessageResult {
            block_hash: hash_after(parent, keccak256(msg.encode_to_vec()).as_slice()),
            send_root: prev.map(|r| r.send_root).unwrap_or_default(),
        }
    }
}

struct HashChainBlock {
    msg_idx: u64,
    header: L1IncomingMessageHeader,
    delayed_messages_read: u64,
    gas_left: u64,
    txes: Vec<Vec<u8>>,
    blocks: std::sync::Arc<Mutex<Vec<MessageResult>>>,
}

impl BlockBuilder for HashChainBlock {
    fn apply(&mut self, tx: &[u8]) -> ApplyOutcome {
        if tx.is_empty() {
            return ApplyOutcome::Invalid(anyhow::anyhow!("empty transaction"));
        }
        let gas = tx_gas(tx);
        if gas > self.gas_left {
            return ApplyOutcome::GasLimitReached;
        }
        self.gas_left -= gas;
        self.txes.push(tx.to_vec());
        // A leading zero byte marks a transaction that reverts.
        ApplyOutcome::Applied(TxResult { gas_used: gas, reverted: tx[0] == 0 })
    }

    fn revert_last(&mut self) {
        if let Some(tx) = self.txes.pop() {
            self.gas_left += tx_gas(&tx);
        }
    }

    fn tx_count(&self) -> usize {
        self.txes.len()
    }

    fn commit(self: Box<Self>) -> Result<MessageResult> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if blocks.len() as u64 != self.msg_idx {
            anyhow::bail!("block for message {} built on stale head {}", self.msg_idx, blocks.len());
        }
        let msg = MessageWithMetadata {
            message: rollup_primitives::l1::L1IncomingMessage {
                header: self.header.clone(),
                l2msg: l2_message_from_txes(self.txes.iter().map(Vec::as_slice))?,
                batch_gas_cost: None,
            },
            delayed_messages_read: self.delayed_messages_read,
        };
        let result = HashChainEngine::next_result(blocks.last(), &msg);
        blocks.push(result);
        Ok(result)
    }
}

#[async_trait]
impl ExecEngine for HashChainEngine {
    async fn head_message_count(&self) -> Result<u64> {
        Ok(self.lock_blocks().len() as u64)
    }

    async fn digest_message(&self, msg_idx: u64, msg: &MessageWithMetadata) -> Result<MessageResult> {
        let mut blocks = self.lock_blocks();
        if blocks.len() as u64 != msg_idx {
            anyhow::bail!("cannot digest message {msg_idx} on head {}", blocks.len());
        }
        let result = Self::next_result(blocks.last(), msg);
        blocks.push(result);
        Ok(result)
    }

    async fn start_block(
        &self,
        msg_idx: u64,
        header: &L1IncomingMessageHeader,
        delayed_messages_read: u64,
    ) -> Result<Box<dyn BlockBuilder>> {
        Ok(Box::new(HashChainBlock {
            msg_idx,
            header: header.clone(),
            delayed_messages_read,
            gas_left: self.block_gas_limit,
            txes: Vec::new(),
            blocks: self.blocks.clone(),
        }))
    }

    async fn reorg_to(&self, count: u64) -> Result<()> {
        self.lock_blocks().truncate(count as usize);
        Ok(())
    }
}
