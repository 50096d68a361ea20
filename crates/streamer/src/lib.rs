//! The canonical message log and the loop that replays it into blocks.

pub mod engine;
pub mod error;
pub mod hooks;
pub mod streamer;

pub use error::{StreamerError, TxError};
pub use streamer::{should_broadcast_during_sync, MessageBroadcaster, SequencingLockout, StreamerConfig, TransactionStreamer};
