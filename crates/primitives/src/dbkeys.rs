// Message log owned by the transaction streamer.
pub const MESSAGE_PREFIX: &[u8] = b"m";
pub const MESSAGE_RESULT_PREFIX: &[u8] = b"r";

// Inbox state owned by the inbox tracker.
pub const RLP_DELAYED_MESSAGE_PREFIX: &[u8] = b"e";
pub const PARENT_CHAIN_BLOCK_NUMBER_PREFIX: &[u8] = b"p";
pub const SEQUENCER_BATCH_META_PREFIX: &[u8] = b"s";
pub const DELAYED_SEQUENCED_PREFIX: &[u8] = b"a";

pub const MESSAGE_COUNT_KEY: &[u8] = b"_messageCount";
pub const DELAYED_MESSAGE_COUNT_KEY: &[u8] = b"_delayedMessageCount";
pub const SEQUENCER_BATCH_COUNT_KEY: &[u8] = b"_sequencerBatchCount";
pub const DB_SCHEMA_VERSION_KEY: &[u8] = b"_schemaVersion";

pub const CURRENT_DB_SCHEMA_VERSION: u64 = 1;

pub fn uint64_to_key(x: u64) -> [u8; 8] {
    x.to_be_bytes()
}

pub fn db_key(prefix: &[u8], index: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(prefix.len() + 8);
    v.extend_from_slice(prefix);
    v.extend_from_slice(&uint64_to_key(index));
    v
}
