//! Durable inbox state: the key/value seams, the batch multiplexer and the
//! accumulator-chained tracker of delayed messages and sequencer batches.

pub mod db;
pub mod error;
pub mod multiplexer;
pub mod streamer;
pub mod tracker;
pub mod util;

pub use error::InboxError;
