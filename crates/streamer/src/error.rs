/// Conditions raised by the transaction streamer that callers are expected to branch on.
#[derive(Debug, thiserror::Error)]
pub enum StreamerError {
    #[error("missing previous message {0}")]
    MissingPreviousMessage(u64),
    #[error("reorg required at message {pos} but not allowed")]
    ReorgNotAllowed { pos: u64 },
    #[error("cannot reorg out init message")]
    CannotReorgInitMessage,
    #[error("attempted to insert jump from {from} delayed messages read to {to} delayed messages read at message index {pos}")]
    DelayedMessagesReadJump { pos: u64, from: u64, to: u64 },
    #[error("attempted to insert delayed messages at incorrect position got {got} expected {expected}")]
    DelayedSequenceMismatch { expected: u64, got: u64 },
    #[error("block production is behind: {produced} blocks for {messages} messages")]
    ExecutionBehind { produced: u64, messages: u64 },
}

/// Why a locally sequenced transaction did not make it into a block.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    #[error("transaction rejected by filter: {0}")]
    Filtered(String),
    #[error("invalid transaction: {0}")]
    Invalid(String),
    #[error("transaction does not fit in an empty block")]
    ExceedsBlockGasLimit,
}
