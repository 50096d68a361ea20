//! Fleet-wide election of the single node allowed to sequence.

pub mod config;
pub mod coordinator;
pub mod keys;
pub mod store;

pub use config::SeqCoordinatorConfig;
pub use coordinator::{CoordinatorError, SeqCoordinator};
pub use store::{CoordinationStore, MemoryStore, RedisStore, StoreError, StoreOp};
