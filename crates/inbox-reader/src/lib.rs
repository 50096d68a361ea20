//! Parent chain polling loop that feeds the inbox tracker and repairs reorgs.

pub mod config;
pub mod reader;

pub use config::{InboxReaderConfig, ReadMode};
pub use reader::{InboxReader, ReaderError};
