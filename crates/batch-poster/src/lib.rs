pub mod config;
pub mod poster;
pub mod segments;

pub use config::{BatchPosterConfig, CompressionLevelStep, CompressionLevels, CompressionLevelsError};
pub use poster::{encode_add_batch, BatchPoster, BatchPosterPosition, BatchSubmitter, CalldataSubmitter, PostedBatch};
pub use segments::{BatchSegments, SealedBatch, SegmentsError};
