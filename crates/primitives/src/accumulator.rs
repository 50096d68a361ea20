use alloy_primitives::{keccak256, B256};

use crate::l1::L1IncomingMessage;

/// keccak256(prev ‖ msg). Every accumulator in the inbox is a link of this chain.
pub fn hash_after(prev: B256, msg: &[u8]) -> B256 {
    let mut data = Vec::with_capacity(32 + msg.len());
    data.extend_from_slice(prev.as_slice());
    data.extend_from_slice(msg);
    keccak256(&data)
}

/// Hash committing to a delayed message: the fixed-width header fields
/// followed by the hash of the L2 payload.
pub fn delayed_message_hash(msg: &L1IncomingMessage) -> B256 {
    let header = &msg.header;
    let mut buf = Vec::with_capacity(1 + 20 + 8 + 8 + 32 + 32 + 32);
    buf.push(header.kind);
    buf.extend_from_slice(header.poster.as_slice());
    buf.extend_from_slice(&header.block_number.to_be_bytes());
    buf.extend_from_slice(&header.timestamp.to_be_bytes());
    buf.extend_from_slice(header.request_id.unwrap_or_default().as_slice());
    buf.extend_from_slice(&header.l1_base_fee.to_be_bytes::<32>());
    buf.extend_from_slice(keccak256(&msg.l2msg).as_slice());
    keccak256(&buf)
}

/// Accumulator after appending `msg` to a delayed inbox whose running accumulator is `before`.
pub fn delayed_accumulator_after(before: B256, msg: &L1IncomingMessage) -> B256 {
    hash_after(before, delayed_message_hash(msg).as_slice())
}

/// Folds a sequence of delayed messages into their accumulators, starting from `start`.
pub fn delayed_accumulator_chain<'a, I>(start: B256, messages: I) -> Vec<B256>
where
    I: IntoIterator<Item = &'a L1IncomingMessage>,
{
    let mut acc = start;
    messages
        .into_iter()
        .map(|m| {
            acc = delayed_accumulator_after(acc, m);
            acc
        })
        .collect()
}
