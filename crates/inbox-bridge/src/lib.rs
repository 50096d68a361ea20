//! L1 clients for the delayed bridge and the sequencer inbox.

pub mod abi;
pub mod eth_delayed;
pub mod eth_sequencer;
pub mod header_reader;
pub mod rpc;
pub mod selectors;
pub mod traits;
pub mod types;

#[cfg(test)]
mod tests;
