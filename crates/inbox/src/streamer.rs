use anyhow::Result;
use async_trait::async_trait;
use rollup_primitives::message::MessageWithMetadata;

use crate::db::Batch;

/// The part of the message log the tracker writes through. Both calls take ownership
/// of the tracker's pending write batch and commit it together with their own writes.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Truncates the message log to `count` messages.
    async fn reorg_to_and_end_batch(&self, batch: Box<dyn Batch>, count: u64) -> Result<()>;

    /// Writes `messages` starting at position `first_msg_idx`. With `messages_are_confirmed`
    /// a divergence from the stored log is resolved by reorging; otherwise it is an error.
    async fn add_messages_and_end_batch(
        &self,
        first_msg_idx: u64,
        messages_are_confirmed: bool,
        messages: Vec<MessageWithMetadata>,
        batch: Box<dyn Batch>,
    ) -> Result<()>;

    /// Offers messages that were just confirmed on L1 to the feed while catching up.
    /// `threshold` is the message count as of two batches before the newest one.
    fn broadcast_during_sync(&self, _first_msg_idx: u64, _messages: &[MessageWithMetadata], _threshold: u64) {}
}
