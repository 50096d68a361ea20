use std::time::Duration;

use alloy_primitives::Address;
use rollup_primitives::batch::SEQUENCER_MESSAGE_HEADER_SIZE;

pub const MAX_BROTLI_LEVEL: u32 = 11;

/// Compression settings that apply once the backlog reaches `backlog` batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressionLevelStep {
    pub backlog: u64,
    pub level: u32,
    pub recompression_level: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompressionLevelsError {
    #[error("compression levels must not be empty")]
    Empty,
    #[error("first compression level step must start at backlog 0, got {0}")]
    FirstBacklogNotZero(u64),
    #[error("compression level backlogs must be strictly ascending: step {index} has {backlog} after {previous}")]
    BacklogNotAscending { index: usize, backlog: u64, previous: u64 },
    #[error("compression levels must not increase with backlog: step {index} has {level} after {previous}")]
    LevelIncreases { index: usize, level: u32, previous: u32 },
    #[error("recompression levels must not increase with backlog: step {index} has {level} after {previous}")]
    RecompressionLevelIncreases { index: usize, level: u32, previous: u32 },
    #[error("step {index}: recompression level {recompression_level} is below compression level {level}")]
    RecompressionBelowLevel { index: usize, level: u32, recompression_level: u32 },
    #[error("step {index}: level {level} is above the maximum brotli level {MAX_BROTLI_LEVEL}")]
    LevelTooHigh { index: usize, level: u32 },
}

/// Backlog-indexed compression table. The step with the largest backlog not above the
/// current backlog wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionLevels(pub Vec<CompressionLevelStep>);

impl Default for CompressionLevels {
    fn default() -> Self {
        Self(vec![
            CompressionLevelStep { backlog: 0, level: 11, recompression_level: 11 },
            CompressionLevelStep { backlog: 21, level: 6, recompression_level: 11 },
            CompressionLevelStep { backlog: 41, level: 6, recompression_level: 6 },
            CompressionLevelStep { backlog: 61, level: 4, recompression_level: 6 },
        ])
    }
}

impl CompressionLevels {
    pub fn validate(&self) -> Result<(), CompressionLevelsError> {
        let first = self.0.first().ok_or(CompressionLevelsError::Empty)?;
        if first.backlog != 0 {
            return Err(CompressionLevelsError::FirstBacklogNotZero(first.backlog));
        }
        for (index, step) in self.0.iter().enumerate() {
            if step.level > MAX_BROTLI_LEVEL {
                return Err(CompressionLevelsError::LevelTooHigh { index, level: step.level });
            }
            if step.recompression_level > MAX_BROTLI_LEVEL {
                return Err(CompressionLevelsError::LevelTooHigh { index, level: step.recompression_level });
            }
            if step.recompression_level < step.level {
                return Err(CompressionLevelsError::RecompressionBelowLevel {
                    index,
                    level: step.level,
                    recompression_level: step.recompression_level,
                });
            }
            let Some(prev) = index.checked_sub(1).map(|i| self.0[i]) else { continue };
            if step.backlog <= prev.backlog {
                return Err(CompressionLevelsError::BacklogNotAscending {
                    index,
                    backlog: step.backlog,
                    previous: prev.backlog,
                });
            }
            if step.level > prev.level {
                return Err(CompressionLevelsError::LevelIncreases { index, level: step.level, previous: prev.level });
            }
            if step.recompression_level > prev.recompression_level {
                return Err(CompressionLevelsError::RecompressionLevelIncreases {
                    index,
                    level: step.recompression_level,
                    previous: prev.recompression_level,
                });
            }
        }
        Ok(())
    }

    /// Returns `(level, recompression_level)` for `backlog`.
    pub fn select(&self, backlog: u64) -> (u32, u32) {
        self.0
            .iter()
            .rev()
            .find(|step| step.backlog <= backlog)
            .map(|step| (step.level, step.recompression_level))
            .unwrap_or((MAX_BROTLI_LEVEL, MAX_BROTLI_LEVEL))
    }
}

#[derive(Clone, Debug)]
pub struct BatchPosterConfig {
    pub enable: bool,
    /// Upper bound on the posted batch including its header.
    pub max_size: usize,
    /// Post a partial batch once its oldest message is this old.
    pub max_delay: Duration,
    pub poll_interval: Duration,
    pub error_delay: Duration,
    pub sequencer_inbox: Address,
    pub from: Address,
    pub gas_refunder: Address,
    pub compression_levels: CompressionLevels,
}

impl Default for BatchPosterConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_size: 100_000,
            max_delay: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(10),
            error_delay: Duration::from_secs(10),
            sequencer_inbox: Address::ZERO,
            from: Address::ZERO,
            gas_refunder: Address::ZERO,
            compression_levels: CompressionLevels::default(),
        }
    }
}

impl BatchPosterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size <= SEQUENCER_MESSAGE_HEADER_SIZE + 1 {
            anyhow::bail!(
                "batch poster max-size {} must exceed the {} byte header",
                self.max_size,
                SEQUENCER_MESSAGE_HEADER_SIZE + 1
            );
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("batch poster poll-interval must be positive");
        }
        self.compression_levels.validate()?;
        Ok(())
    }

    /// Budget left for the compressed payload once the header is accounted for.
    pub fn payload_size_limit(&self) -> usize {
        self.max_size.saturating_sub(SEQUENCER_MESSAGE_HEADER_SIZE)
    }
}
