use alloy_primitives::B256;
use alloy_rlp::{RlpDecodable, RlpEncodable};

use crate::l1::L1IncomingMessage;

/// One entry of the message log. `delayed_messages_read` is the cumulative number of
/// delayed messages consumed once this message has been applied.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MessageWithMetadata {
    pub message: L1IncomingMessage,
    pub delayed_messages_read: u64,
}

impl MessageWithMetadata {
    pub fn encode_to_vec(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    pub fn decode_from(mut bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(<Self as alloy_rlp::Decodable>::decode(&mut bytes)?)
    }
}

/// Block produced by replaying a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct MessageResult {
    pub block_hash: B256,
    pub send_root: B256,
}
