use std::str::FromStr;
use std::time::Duration;

/// Which parent chain height the reader treats as settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Latest head minus `delay_blocks`.
    #[default]
    Latest,
    Safe,
    Finalized,
}

impl FromStr for ReadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "latest" => Ok(Self::Latest),
            "safe" => Ok(Self::Safe),
            "finalized" => Ok(Self::Finalized),
            other => anyhow::bail!("inbox reader read-mode is invalid: {other}, valid values are latest, safe and finalized"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InboxReaderConfig {
    /// Blocks to stay behind the head in [`ReadMode::Latest`].
    pub delay_blocks: u64,
    /// Wait between polls once caught up, and before retrying after an error.
    pub check_delay: Duration,
    /// Roll local batches back when the chain reports fewer than are stored.
    pub hard_reorg: bool,
    pub min_blocks_to_read: u64,
    pub default_blocks_to_read: u64,
    /// Number of delayed messages and batches a single range read aims for.
    pub target_messages_read: u64,
    pub max_blocks_to_read: u64,
    /// First step taken backwards when stored accumulators disagree with the chain.
    /// Each further disagreement doubles it.
    pub reorg_step_back_blocks: u64,
    pub read_mode: ReadMode,
}

impl Default for InboxReaderConfig {
    fn default() -> Self {
        Self {
            delay_blocks: 0,
            check_delay: Duration::from_secs(60),
            hard_reorg: false,
            min_blocks_to_read: 1,
            default_blocks_to_read: 100,
            target_messages_read: 500,
            max_blocks_to_read: 2000,
            reorg_step_back_blocks: 100,
            read_mode: ReadMode::Latest,
        }
    }
}

impl InboxReaderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_blocks_to_read == 0 {
            anyhow::bail!("inbox reader min-blocks-to-read must be positive");
        }
        if self.min_blocks_to_read > self.default_blocks_to_read || self.default_blocks_to_read > self.max_blocks_to_read {
            anyhow::bail!(
                "inbox reader blocks to read must satisfy min {} <= default {} <= max {}",
                self.min_blocks_to_read,
                self.default_blocks_to_read,
                self.max_blocks_to_read
            );
        }
        if self.reorg_step_back_blocks == 0 {
            anyhow::bail!("inbox reader reorg step back must be positive");
        }
        Ok(())
    }
}
