use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SeqCoordinatorConfig {
    pub enable: bool,
    pub redis_url: String,
    /// Url other nodes forward to while this node is chosen. Empty means never sequence.
    pub my_url: String,
    /// Lease taken on the chosen key by every successful lockout write.
    pub lockout_duration: Duration,
    /// Taken off the local lockout deadline so the lease never lapses mid-write.
    pub lockout_spare: Duration,
    /// Lease of the published message count and the messages themselves.
    pub seq_num_duration: Duration,
    pub update_interval: Duration,
    pub retry_interval: Duration,
    /// Messages pulled from the store per update while on standby.
    pub msg_per_poll: u64,
    /// A standby further than this behind the published count stops advertising liveliness.
    pub max_lag: u64,
}

impl Default for SeqCoordinatorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            redis_url: String::new(),
            my_url: String::new(),
            lockout_duration: Duration::from_secs(60),
            lockout_spare: Duration::from_secs(30),
            seq_num_duration: Duration::from_secs(10 * 24 * 3600),
            update_interval: Duration::from_millis(250),
            retry_interval: Duration::from_millis(50),
            msg_per_poll: 2000,
            max_lag: 2000,
        }
    }
}

impl SeqCoordinatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.enable && self.redis_url.is_empty() {
            anyhow::bail!("sequencer coordinator enabled without a redis url");
        }
        if self.lockout_spare >= self.lockout_duration {
            anyhow::bail!(
                "sequencer coordinator lockout spare {:?} must be shorter than the lockout duration {:?}",
                self.lockout_spare,
                self.lockout_duration
            );
        }
        if self.my_url.contains(',') {
            anyhow::bail!("sequencer coordinator url {} must not contain a comma", self.my_url);
        }
        if self.update_interval.is_zero() || self.msg_per_poll == 0 {
            anyhow::bail!("sequencer coordinator update interval and msg-per-poll must be positive");
        }
        Ok(())
    }

    /// Whether this node takes part in the election at all.
    pub fn can_sequence(&self) -> bool {
        !self.my_url.is_empty()
    }
}
