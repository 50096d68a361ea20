use alloy_primitives::B256;

/// Conditions raised by the inbox tracker. Callers branch on these through
/// `anyhow::Error::downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("accumulator not found")]
    AccumulatorNotFound,
    /// A batch references delayed messages this node does not have (or has different ones).
    /// The delayed inbox should be rescanned before the batch is retried.
    #[error("delayed messages mismatch")]
    DelayedMessagesMismatch,
    #[error("missing previous delayed message {0}")]
    MissingPreviousDelayedMessage(u64),
    #[error("unexpected delayed sequence number {got}, expected {expected}")]
    UnexpectedDelayedSequenceNumber { expected: u64, got: u64 },
    #[error("previous delayed accumulator mismatch for message {seq_num}: have {have}, message claims {claimed}")]
    DelayedAccumulatorMismatch { seq_num: u64, have: B256, claimed: B256 },
    #[error("missing previous batch {0}")]
    MissingPreviousBatch(u64),
    #[error("unexpected batch sequence number {got}, expected {expected}")]
    UnexpectedBatchSequenceNumber { expected: u64, got: u64 },
    #[error("previous batch accumulator mismatch for batch {seq_num}: have {have}, batch claims {claimed}")]
    BatchAccumulatorMismatch { seq_num: u64, have: B256, claimed: B256 },
    #[error("batch {seq_num} delayed count went backwards from {prev} to {got}")]
    BatchDelayedCountWentBackwards { seq_num: u64, prev: u64, got: u64 },
    #[error("attempted to reorg to future delayed count {requested} (have {current})")]
    ReorgToFutureDelayedCount { requested: u64, current: u64 },
    #[error("attempted to reorg to future batch count {requested} (have {current})")]
    ReorgToFutureBatchCount { requested: u64, current: u64 },
    #[error("reorging of sequencer batch {batch} via delayed messages reorg to count {delayed_count} disabled in this instance")]
    BatchReorgDisabled { batch: u64, delayed_count: u64 },
}

impl InboxError {
    pub fn is(err: &anyhow::Error, pred: impl Fn(&InboxError) -> bool) -> bool {
        err.downcast_ref::<InboxError>().is_some_and(pred)
    }
}
