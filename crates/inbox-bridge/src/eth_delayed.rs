use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use rollup_primitives::l1::{L1IncomingMessage, L1IncomingMessageHeader};
use tracing::debug;

use crate::abi::{self, selector, topic};
use crate::rpc::{BlockTag, RpcClient, RpcLog};
use crate::selectors::{
    EVT_INBOX_MESSAGE_DELIVERED, EVT_INBOX_MESSAGE_FROM_ORIGIN, EVT_MESSAGE_DELIVERED, SIG_DELAYED_COUNT,
    SIG_DELAYED_INBOX_ACCS, SIG_SEND_L2_FROM_ORIGIN,
};
use crate::traits::DelayedBridge;
use crate::types::DelayedInboxMessage;

/// Decoded `MessageDelivered` event, before its payload is attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDelivered {
    pub message_index: u64,
    pub before_inbox_acc: B256,
    pub inbox: Address,
    pub kind: u8,
    pub sender: Address,
    pub message_data_hash: B256,
    pub base_fee_l1: U256,
    pub timestamp: u64,
}

pub fn parse_message_delivered(log: &RpcLog) -> anyhow::Result<MessageDelivered> {
    if log.topics.first() != Some(&topic(EVT_MESSAGE_DELIVERED)) {
        anyhow::bail!("log is not a MessageDelivered event");
    }
    let message_index = abi::topic_u64(&log.topics, 1)?;
    let before_inbox_acc = *log.topics.get(2).ok_or_else(|| anyhow::anyhow!("missing beforeInboxAcc topic"))?;
    let data = log.data.as_ref();
    let kind = u8::try_from(abi::word_u64(data, 1)?).map_err(|_| anyhow::anyhow!("message kind out of range"))?;
    Ok(MessageDelivered {
        message_index,
        before_inbox_acc,
        inbox: abi::word_address(data, 0)?,
        kind,
        sender: abi::word_address(data, 2)?,
        message_data_hash: abi::word_b256(data, 3)?,
        base_fee_l1: abi::word_u256(data, 4)?,
        timestamp: abi::word_u64(data, 5)?,
    })
}

pub struct EthDelayedBridge {
    rpc: Arc<RpcClient>,
    bridge_addr: Address,
}

impl EthDelayedBridge {
    pub fn new(rpc: Arc<RpcClient>, bridge_addr: Address) -> Self {
        Self { rpc, bridge_addr }
    }

    /// Payloads for the given message indices, looked up on the inboxes that delivered them.
    async fn fetch_payloads(
        &self,
        from_block: u64,
        to_block: u64,
        by_inbox: &HashMap<Address, Vec<u64>>,
    ) -> anyhow::Result<HashMap<u64, Vec<u8>>> {
        let mut payloads = HashMap::new();
        let inboxes: Vec<Address> = by_inbox.keys().copied().collect();
        let indices: Vec<B256> = by_inbox.values().flatten().map(|i| B256::from(U256::from(*i))).collect();
        if inboxes.is_empty() {
            return Ok(payloads);
        }
        let logs = self
            .rpc
            .get_logs(
                &inboxes,
                from_block,
                to_block,
                vec![vec![topic(EVT_INBOX_MESSAGE_DELIVERED), topic(EVT_INBOX_MESSAGE_FROM_ORIGIN)], indices],
            )
            .await?;
        for lg in logs {
            let index = abi::topic_u64(&lg.topics, 1)?;
            let payload = if lg.topics.first() == Some(&topic(EVT_INBOX_MESSAGE_DELIVERED)) {
                abi::dynamic_bytes(lg.data.as_ref(), 0)?
            } else {
                let tx_hash = lg.transaction_hash.ok_or_else(|| anyhow::anyhow!("origin message {index} without tx hash"))?;
                let input = self.rpc.transaction_input(tx_hash).await?;
                match input.split_first_chunk::<4>() {
                    Some((sel, args)) if *sel == selector(SIG_SEND_L2_FROM_ORIGIN) => abi::dynamic_bytes(args, 0)?,
                    _ => anyhow::bail!("tx {tx_hash} delivering message {index} is not sendL2MessageFromOrigin"),
                }
            };
            payloads.insert(index, payload);
        }
        Ok(payloads)
    }
}

#[async_trait]
impl DelayedBridge for EthDelayedBridge {
    async fn get_message_count(&self, block_number: u64) -> anyhow::Result<u64> {
        let res = self.rpc.eth_call(self.bridge_addr, &selector(SIG_DELAYED_COUNT), BlockTag::Number(block_number)).await?;
        abi::word_u64(&res, 0)
    }

    async fn get_accumulator(&self, seq_num: u64, block_number: u64) -> anyhow::Result<B256> {
        let data = abi::CallEncoder::default().uint(seq_num).encode(SIG_DELAYED_INBOX_ACCS);
        let res = self.rpc.eth_call(self.bridge_addr, &data, BlockTag::Number(block_number)).await?;
        abi::word_b256(&res, 0)
    }

    async fn lookup_messages_in_range(&self, from_block: u64, to_block: u64) -> anyhow::Result<Vec<DelayedInboxMessage>> {
        let logs = self
            .rpc
            .get_logs(&[self.bridge_addr], from_block, to_block, vec![vec![topic(EVT_MESSAGE_DELIVERED)]])
            .await?;
        let mut delivered = BTreeMap::new();
        let mut by_inbox: HashMap<Address, Vec<u64>> = HashMap::new();
        for lg in logs {
            let ev = parse_message_delivered(&lg)?;
            by_inbox.entry(ev.inbox).or_default().push(ev.message_index);
            delivered.insert(ev.message_index, (ev, lg));
        }
        let mut payloads = self.fetch_payloads(from_block, to_block, &by_inbox).await?;
        debug!(from_block, to_block, messages = delivered.len(), "looked up delayed messages");

        let mut out = Vec::with_capacity(delivered.len());
        for (index, (ev, lg)) in delivered {
            let data = payloads.remove(&index).ok_or_else(|| anyhow::anyhow!("message {index} data not found"))?;
            if keccak256(&data) != ev.message_data_hash {
                anyhow::bail!("found message {index} data with mismatched hash");
            }
            let block_number = lg.block_number.ok_or_else(|| anyhow::anyhow!("pending log for message {index}"))?;
            out.push(DelayedInboxMessage {
                block_hash: lg.block_hash.unwrap_or_default(),
                before_inbox_acc: ev.before_inbox_acc,
                message: L1IncomingMessage {
                    header: L1IncomingMessageHeader {
                        kind: ev.kind,
                        poster: ev.sender,
                        block_number,
                        timestamp: ev.timestamp,
                        request_id: Some(B256::from(U256::from(index))),
                        l1_base_fee: ev.base_fee_l1,
                    },
                    l2msg: data,
                    batch_gas_cost: None,
                },
                parent_chain_block_number: block_number,
            });
        }
        Ok(out)
    }
}
