use std::path::PathBuf;
use std::time::Duration;

use alloy_primitives::Address;
use clap::Parser;
use rollup_batch_poster::BatchPosterConfig;
use rollup_inbox_reader::{InboxReaderConfig, ReadMode};
use rollup_seq_coordinator::SeqCoordinatorConfig;
use rollup_streamer::StreamerConfig;

use crate::chaininfo::{self, RollupAddresses};

#[derive(Debug, Clone, Parser)]
#[command(name = "rollup-node", about = "Derives the rollup message log from the parent chain")]
pub struct NodeArgs {
    #[arg(long, env = "ROLLUP_DB_PATH", default_value = "./rollup-db")]
    pub db_path: PathBuf,

    #[arg(long = "parent-chain.url", env = "ROLLUP_PARENT_CHAIN_URL", default_value = "http://localhost:8545")]
    pub parent_chain_url: String,

    #[arg(long = "parent-chain.poll-interval-ms", default_value_t = 1000)]
    pub parent_chain_poll_interval_ms: u64,

    /// JSON chain list; `--chain.name` picks the entry supplying contract addresses.
    #[arg(long = "chain.info-file", env = "ROLLUP_CHAIN_INFO_FILE")]
    pub chain_info_file: Option<PathBuf>,

    #[arg(long = "chain.name", env = "ROLLUP_CHAIN_NAME")]
    pub chain_name: Option<String>,

    #[arg(long = "rollup.bridge", env = "ROLLUP_BRIDGE")]
    pub bridge: Option<Address>,

    #[arg(long = "rollup.sequencer-inbox", env = "ROLLUP_SEQUENCER_INBOX")]
    pub sequencer_inbox: Option<Address>,

    #[arg(long = "rollup.first-message-block", env = "ROLLUP_FIRST_MESSAGE_BLOCK")]
    pub first_message_block: Option<u64>,

    #[arg(long = "execution.block-gas-limit", default_value_t = 32_000_000)]
    pub block_gas_limit: u64,

    #[arg(long = "streamer.execute-message-loop-delay-ms", default_value_t = 100)]
    pub execute_message_loop_delay_ms: u64,

    #[arg(long = "inbox-reader.delay-blocks", default_value_t = 0)]
    pub reader_delay_blocks: u64,

    #[arg(long = "inbox-reader.check-delay-ms", default_value_t = 60_000)]
    pub reader_check_delay_ms: u64,

    #[arg(long = "inbox-reader.hard-reorg", default_value_t = false)]
    pub reader_hard_reorg: bool,

    #[arg(long = "inbox-reader.read-mode", default_value = "latest")]
    pub reader_read_mode: ReadMode,

    #[arg(long = "inbox-reader.target-messages-read", default_value_t = 500)]
    pub reader_target_messages_read: u64,

    #[arg(long = "inbox-reader.max-blocks-to-read", default_value_t = 2000)]
    pub reader_max_blocks_to_read: u64,

    #[arg(long = "inbox-reader.reorg-step-back-blocks", default_value_t = 100)]
    pub reader_reorg_step_back_blocks: u64,

    #[arg(long = "poster.enable", env = "ROLLUP_POSTER_ENABLE", default_value_t = false)]
    pub poster_enable: bool,

    #[arg(long = "poster.max-size", default_value_t = 100_000)]
    pub poster_max_size: usize,

    #[arg(long = "poster.max-delay-secs", default_value_t = 3600)]
    pub poster_max_delay_secs: u64,

    #[arg(long = "poster.poll-interval-ms", default_value_t = 10_000)]
    pub poster_poll_interval_ms: u64,

    #[arg(long = "poster.from", env = "ROLLUP_POSTER_FROM")]
    pub poster_from: Option<Address>,

    #[arg(long = "poster.gas-refunder")]
    pub poster_gas_refunder: Option<Address>,

    #[arg(long = "seq-coordinator.enable", env = "ROLLUP_SEQ_COORDINATOR_ENABLE", default_value_t = false)]
    pub coordinator_enable: bool,

    #[arg(long = "seq-coordinator.redis-url", env = "ROLLUP_REDIS_URL", default_value = "")]
    pub coordinator_redis_url: String,

    #[arg(long = "seq-coordinator.my-url", env = "ROLLUP_SEQ_COORDINATOR_MY_URL", default_value = "")]
    pub coordinator_my_url: String,

    #[arg(long = "seq-coordinator.lockout-duration-ms", default_value_t = 60_000)]
    pub coordinator_lockout_ms: u64,

    #[arg(long = "seq-coordinator.lockout-spare-ms", default_value_t = 30_000)]
    pub coordinator_lockout_spare_ms: u64,

    #[arg(long = "seq-coordinator.update-interval-ms", default_value_t = 250)]
    pub coordinator_update_interval_ms: u64,

    #[arg(long = "seq-coordinator.msg-per-poll", default_value_t = 2000)]
    pub coordinator_msg_per_poll: u64,

    #[arg(long = "seq-coordinator.max-lag", default_value_t = 2000)]
    pub coordinator_max_lag: u64,
}

impl NodeArgs {
    /// Contract addresses from explicit flags, falling back to the chain info file.
    pub fn rollup_addresses(&self) -> anyhow::Result<RollupAddresses> {
        let from_file = match (&self.chain_info_file, &self.chain_name) {
            (Some(path), Some(name)) => {
                let chains = chaininfo::load(path)?;
                let chain = chains
                    .select_by_name(name)
                    .ok_or_else(|| anyhow::anyhow!("chain {name} not found in {}", path.display()))?;
                chain.rollup.clone()
            }
            (Some(_), None) => anyhow::bail!("--chain.info-file needs --chain.name"),
            _ => None,
        };
        let bridge = self
            .bridge
            .or(from_file.as_ref().map(|r| r.bridge))
            .ok_or_else(|| anyhow::anyhow!("no bridge address: pass --rollup.bridge or a chain info file"))?;
        let sequencer_inbox = self
            .sequencer_inbox
            .or(from_file.as_ref().map(|r| r.sequencer_inbox))
            .ok_or_else(|| anyhow::anyhow!("no sequencer inbox address: pass --rollup.sequencer-inbox or a chain info file"))?;
        let deployed_at = self.first_message_block.or(from_file.as_ref().map(|r| r.deployed_at)).unwrap_or(0);
        Ok(RollupAddresses { bridge, sequencer_inbox, deployed_at })
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig { execute_message_loop_delay: Duration::from_millis(self.execute_message_loop_delay_ms) }
    }

    pub fn inbox_reader_config(&self) -> InboxReaderConfig {
        InboxReaderConfig {
            delay_blocks: self.reader_delay_blocks,
            check_delay: Duration::from_millis(self.reader_check_delay_ms),
            hard_reorg: self.reader_hard_reorg,
            target_messages_read: self.reader_target_messages_read,
            max_blocks_to_read: self.reader_max_blocks_to_read,
            reorg_step_back_blocks: self.reader_reorg_step_back_blocks,
            read_mode: self.reader_read_mode,
            ..Default::default()
        }
    }

    pub fn poster_config(&self, addresses: &RollupAddresses) -> BatchPosterConfig {
        BatchPosterConfig {
            enable: self.poster_enable,
            max_size: self.poster_max_size,
            max_delay: Duration::from_secs(self.poster_max_delay_secs),
            poll_interval: Duration::from_millis(self.poster_poll_interval_ms),
            sequencer_inbox: addresses.sequencer_inbox,
            from: self.poster_from.unwrap_or_default(),
            gas_refunder: self.poster_gas_refunder.unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn coordinator_config(&self) -> SeqCoordinatorConfig {
        SeqCoordinatorConfig {
            enable: self.coordinator_enable,
            redis_url: self.coordinator_redis_url.clone(),
            my_url: self.coordinator_my_url.clone(),
            lockout_duration: Duration::from_millis(self.coordinator_lockout_ms),
            lockout_spare: Duration::from_millis(self.coordinator_lockout_spare_ms),
            update_interval: Duration::from_millis(self.coordinator_update_interval_ms),
            msg_per_poll: self.coordinator_msg_per_poll,
            max_lag: self.coordinator_max_lag,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.inbox_reader_config().validate()?;
        self.coordinator_config().validate()?;
        if self.poster_enable {
            if self.poster_from.is_none() {
                anyhow::bail!("--poster.enable needs --poster.from");
            }
            self.poster_config(&self.rollup_addresses()?).validate()?;
        }
        Ok(())
    }
}
