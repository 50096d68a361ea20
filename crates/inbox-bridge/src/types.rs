use alloy_primitives::{Address, B256};
use rollup_primitives::accumulator::delayed_accumulator_after;
use rollup_primitives::batch::SequencerMessageHeader;
use rollup_primitives::l1::L1IncomingMessage;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DelayedInboxMessage {
    pub block_hash: B256,
    pub before_inbox_acc: B256,
    pub message: L1IncomingMessage,
    pub parent_chain_block_number: u64,
}

impl DelayedInboxMessage {
    pub fn after_inbox_acc(&self) -> B256 {
        delayed_accumulator_after(self.before_inbox_acc, &self.message)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeBounds {
    pub min_timestamp: u64,
    pub max_timestamp: u64,
    pub min_block_number: u64,
    pub max_block_number: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequencerInboxBatch {
    pub sequence_number: u64,
    pub before_inbox_acc: B256,
    pub after_inbox_acc: B256,
    pub after_delayed_count: u64,
    pub after_delayed_acc: B256,
    pub time_bounds: TimeBounds,
    pub data_location: u8,
    pub bridge_address: Address,
    pub parent_chain_block_number: u64,
    pub block_hash: B256,
    pub tx_hash: B256,
    /// Header followed by the posted payload; what the multiplexer consumes.
    pub serialized: Vec<u8>,
}

impl SequencerInboxBatch {
    pub fn header(&self) -> SequencerMessageHeader {
        SequencerMessageHeader {
            min_timestamp: self.time_bounds.min_timestamp,
            max_timestamp: self.time_bounds.max_timestamp,
            min_l1_block: self.time_bounds.min_block_number,
            max_l1_block: self.time_bounds.max_block_number,
            after_delayed_messages: self.after_delayed_count,
        }
    }

    /// Fills `serialized` from the batch's own bounds and the payload posted on L1.
    pub fn set_payload(&mut self, payload: &[u8]) {
        let mut out = self.header().encode().to_vec();
        out.extend_from_slice(payload);
        self.serialized = out;
    }
}
