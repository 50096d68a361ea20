use alloy_primitives::B256;
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// Summary stored for every tracked sequencer batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BatchMetadata {
    pub accumulator: B256,
    /// Message count once every message of this batch is in the log.
    pub message_count: u64,
    pub delayed_message_count: u64,
    pub parent_chain_block: u64,
}

pub const SEQUENCER_MESSAGE_HEADER_SIZE: usize = 40;

/// Fixed-width header that precedes every sequencer batch payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequencerMessageHeader {
    pub min_timestamp: u64,
    pub max_timestamp: u64,
    pub min_l1_block: u64,
    pub max_l1_block: u64,
    pub after_delayed_messages: u64,
}

impl SequencerMessageHeader {
    pub fn encode(&self) -> [u8; SEQUENCER_MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; SEQUENCER_MESSAGE_HEADER_SIZE];
        let fields = [
            self.min_timestamp,
            self.max_timestamp,
            self.min_l1_block,
            self.max_l1_block,
            self.after_delayed_messages,
        ];
        for (chunk, field) in out.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        out
    }

    /// Parses the header and returns it along with the remaining payload.
    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, &[u8])> {
        if data.len() < SEQUENCER_MESSAGE_HEADER_SIZE {
            anyhow::bail!("sequencer message missing L1 header: {} bytes", data.len());
        }
        let mut fields = [0u64; 5];
        for (field, chunk) in fields.iter_mut().zip(data[..SEQUENCER_MESSAGE_HEADER_SIZE].chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *field = u64::from_be_bytes(word);
        }
        let header = Self {
            min_timestamp: fields[0],
            max_timestamp: fields[1],
            min_l1_block: fields[2],
            max_l1_block: fields[3],
            after_delayed_messages: fields[4],
        };
        Ok((header, &data[SEQUENCER_MESSAGE_HEADER_SIZE..]))
    }

    /// Header with unbounded time bounds, as used for locally built batches.
    pub fn unbounded(after_delayed_messages: u64) -> Self {
        Self {
            min_timestamp: 0,
            max_timestamp: u64::MAX,
            min_l1_block: 0,
            max_l1_block: u64::MAX,
            after_delayed_messages,
        }
    }
}
