//! Shared types for the message-derivation pipeline: L1 incoming messages,
//! the sequenced message log entries, accumulators and the persisted key layout.

pub mod accumulator;
pub mod batch;
pub mod dbkeys;
pub mod l1;
pub mod message;
