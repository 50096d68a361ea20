use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rollup_primitives::message::MessageWithMetadata;
use rollup_streamer::{SequencingLockout, TransactionStreamer};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SeqCoordinatorConfig;
use crate::keys::{
    decode_msg_count, encode_msg_count, liveliness_key_for, message_key_for, parse_priorities, CHOSEN_KEY,
    LIVELINESS_VAL, MSG_COUNT_KEY, PRIORITIES_KEY,
};
use crate::store::{CoordinationStore, StoreError, StoreOp};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("not the chosen sequencer, store shows {0}")]
    NotChosen(String),
    #[error("sequencer lockout expired")]
    LockoutExpired,
    #[error("remote message count {remote} is ahead of expected {expected}")]
    Behind { expected: u64, remote: u64 },
    #[error("lost the race for the sequencer lock")]
    TxConflict,
    #[error("node has no url and cannot sequence")]
    NoUrl,
    #[error("malformed message count in store: {0}")]
    BadMsgCount(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Streamer(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Conditions that only mean another node sequences right now.
    pub fn is_retry_sequencer(&self) -> bool {
        matches!(self, Self::NotChosen(_) | Self::LockoutExpired | Self::Behind { .. } | Self::TxConflict)
    }
}

#[derive(Default)]
struct UpdateState {
    prev_chosen: Option<String>,
    store_errors: u32,
}

pub struct SeqCoordinator {
    store: Arc<dyn CoordinationStore>,
    streamer: Arc<TransactionStreamer>,
    config: SeqCoordinatorConfig,
    epoch: Instant,
    /// Milliseconds since `epoch` until which local sequencing is allowed; 0 when not chosen.
    lockout_until: AtomicU64,
    /// Serializes writes to the lockout keys.
    write_lock: Mutex<()>,
    update_state: Mutex<UpdateState>,
    avoid_lockout: AtomicU32,
}

impl SeqCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        streamer: Arc<TransactionStreamer>,
        config: SeqCoordinatorConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            streamer,
            config,
            epoch: Instant::now(),
            lockout_until: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            update_state: Mutex::new(UpdateState::default()),
            avoid_lockout: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.my_url
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn millis(d: Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    /// Whether the locally cached lockout is still valid.
    pub fn currently_chosen(&self) -> bool {
        self.lockout_until.load(Ordering::Acquire) > self.now_ms()
    }

    pub fn avoiding_lockout(&self) -> bool {
        self.avoid_lockout.load(Ordering::Acquire) > 0
    }

    pub async fn remote_msg_count(&self) -> Result<u64, CoordinatorError> {
        match self.store.get(MSG_COUNT_KEY).await? {
            Some(raw) => decode_msg_count(&raw).map_err(|e| CoordinatorError::BadMsgCount(e.to_string())),
            None => Ok(0),
        }
    }

    /// First url in priority order whose liveliness key is present.
    pub async fn recommend_sequencer_wanting_lockout(&self) -> Result<Option<String>, CoordinatorError> {
        let Some(raw) = self.store.get(PRIORITIES_KEY).await? else {
            return Ok(None);
        };
        for url in parse_priorities(&raw) {
            if self.store.exists(&liveliness_key_for(&url)).await? {
                return Ok(Some(url));
            }
        }
        Ok(None)
    }

    /// Claims or refreshes the chosen key and publishes `msg_count_to_write`, optionally
    /// storing `msg` as message `msg_count_to_write - 1`. Fails unless the chosen key is
    /// empty or ours and the published count is not ahead of `msg_count_expected`.
    pub async fn acquire_lockout_and_write_message(
        &self,
        msg_count_expected: u64,
        msg_count_to_write: u64,
        msg: Option<&MessageWithMetadata>,
    ) -> Result<(), CoordinatorError> {
        if !self.config.can_sequence() {
            return Err(CoordinatorError::NoUrl);
        }
        let _guard = self.write_lock.lock().await;
        let lockout_until = self.now_ms().saturating_add(Self::millis(self.config.lockout_duration));

        let chosen = self.store.get(CHOSEN_KEY).await?;
        if let Some(current) = chosen.as_deref() {
            if current != self.config.my_url.as_bytes() {
                return Err(CoordinatorError::NotChosen(String::from_utf8_lossy(current).into_owned()));
            }
        }
        let remote_raw = self.store.get(MSG_COUNT_KEY).await?;
        let remote = match remote_raw.as_deref() {
            Some(raw) => decode_msg_count(raw).map_err(|e| CoordinatorError::BadMsgCount(e.to_string()))?,
            None => 0,
        };
        if remote > msg_count_expected {
            if msg.is_none() && self.currently_chosen() {
                // A concurrent sequencing call already advanced the count.
                return Ok(());
            }
            info!(expected = msg_count_expected, found = remote, "coordinator failed to become main");
            return Err(CoordinatorError::Behind { expected: msg_count_expected, remote });
        }

        let mut ops = vec![
            StoreOp::set(CHOSEN_KEY, self.config.my_url.as_bytes(), self.config.lockout_duration),
            StoreOp::set(MSG_COUNT_KEY, encode_msg_count(msg_count_to_write), self.config.seq_num_duration),
        ];
        if let (Some(msg), Some(pos)) = (msg, msg_count_to_write.checked_sub(1)) {
            ops.push(StoreOp::set(message_key_for(pos), msg.encode_to_vec(), self.config.seq_num_duration));
        }
        if !self.avoiding_lockout() {
            ops.push(StoreOp::set(
                liveliness_key_for(&self.config.my_url),
                LIVELINESS_VAL,
                self.config.lockout_duration,
            ));
        }
        let expected = [(CHOSEN_KEY, chosen), (MSG_COUNT_KEY, remote_raw)];
        if !self.store.commit_if_unchanged(&expected, ops).await? {
            return Err(CoordinatorError::TxConflict);
        }
        let spare = Self::millis(self.config.lockout_spare);
        self.lockout_until.store(lockout_until.saturating_sub(spare), Ordering::Release);
        Ok(())
    }

    /// Gives up the chosen key if we hold it.
    pub async fn chosen_one_release(&self) -> Result<(), CoordinatorError> {
        let _guard = self.write_lock.lock().await;
        self.lockout_until.store(0, Ordering::Release);
        let mine = Some(self.config.my_url.as_bytes());
        let current = self.store.get(CHOSEN_KEY).await?;
        if current.as_deref() != mine {
            return Ok(());
        }
        if self.store.commit_if_unchanged(&[(CHOSEN_KEY, current)], vec![StoreOp::del(CHOSEN_KEY)]).await? {
            return Ok(());
        }
        // Somebody else moved the key; only still holding it is a failure.
        if self.store.get(CHOSEN_KEY).await?.as_deref() == mine {
            return Err(CoordinatorError::TxConflict);
        }
        Ok(())
    }

    async fn liveliness_update(&self) -> Result<(), CoordinatorError> {
        let _guard = self.write_lock.lock().await;
        let key = liveliness_key_for(&self.config.my_url);
        self.store.set(&key, LIVELINESS_VAL, self.config.lockout_duration).await?;
        Ok(())
    }

    async fn liveliness_release(&self) -> Result<(), CoordinatorError> {
        let _guard = self.write_lock.lock().await;
        self.store.del(&liveliness_key_for(&self.config.my_url)).await?;
        Ok(())
    }

    /// Steps down and stops advertising liveliness until [`Self::seek_lockout`].
    pub async fn release(&self) -> Result<(), CoordinatorError> {
        self.avoid_lockout.fetch_add(1, Ordering::AcqRel);
        if self.config.can_sequence() {
            self.liveliness_release().await?;
            self.chosen_one_release().await?;
        }
        self.update_state.lock().await.prev_chosen = None;
        info!(url = %self.config.my_url, "released sequencer lockout");
        Ok(())
    }

    pub fn seek_lockout(&self) {
        let _ = self.avoid_lockout.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// One round of the election. Returns how long to wait before the next round.
    pub async fn update(&self) -> Duration {
        let mut state = self.update_state.lock().await;
        match self.update_inner(&mut state).await {
            Ok(()) => {
                state.store_errors = 0;
                self.config.update_interval
            }
            Err(err) => {
                if err.is_retry_sequencer() {
                    debug!(%err, "sequencer coordinator did not get the lockout");
                } else {
                    warn!(%err, "sequencer coordinator update failed");
                }
                state.store_errors = state.store_errors.saturating_add(1);
                (self.config.retry_interval * state.store_errors).min(self.config.update_interval)
            }
        }
    }

    async fn update_inner(&self, state: &mut UpdateState) -> Result<(), CoordinatorError> {
        let recommended = self.recommend_sequencer_wanting_lockout().await?;
        let me = self.config.my_url.as_str();
        if self.config.can_sequence() && state.prev_chosen.as_deref() == Some(me) {
            return self.update_with_lockout(state, recommended).await;
        }
        if recommended != state.prev_chosen && recommended.as_deref() != Some(me) {
            info!(recommended = ?recommended, "chosen sequencer changing");
            state.prev_chosen = recommended.clone();
        }

        let remote = self.remote_msg_count().await?;
        let local = self.pull_messages(self.streamer.get_message_count()?, remote).await;
        if !self.config.can_sequence() {
            return Ok(());
        }

        if !self.avoiding_lockout() && local >= remote && recommended.as_deref() == Some(me) {
            if let Err(err) = self.acquire_lockout_and_write_message(local, local, None).await {
                info!(%err, msg_count = local, "sequencer failed to become chosen");
                self.liveliness_update().await?;
                state.prev_chosen = None;
                return Err(err);
            }
            info!(url = me, msg_count = local, "caught chosen-coordinator lock");
            state.prev_chosen = Some(me.to_string());
            return Ok(());
        }

        let lag = remote.saturating_sub(local);
        if self.avoiding_lockout() || lag > self.config.max_lag {
            if lag > self.config.max_lag {
                debug!(lag, max_lag = self.config.max_lag, "too far behind to stand for sequencer");
            }
            self.liveliness_release().await
        } else {
            self.liveliness_update().await
        }
    }

    /// Keepalive for the node that holds the lockout, or handoff when a preferred node is live.
    async fn update_with_lockout(
        &self,
        state: &mut UpdateState,
        recommended: Option<String>,
    ) -> Result<(), CoordinatorError> {
        if let Some(next) = recommended.filter(|next| *next != self.config.my_url) {
            self.chosen_one_release().await?;
            info!(url = %self.config.my_url, next = %next, "released chosen-coordinator lock");
            state.prev_chosen = Some(next);
            return Ok(());
        }
        let margin = (self.config.lockout_duration / 5).max(self.config.update_interval * 5);
        if self.now_ms().saturating_add(Self::millis(margin)) < self.lockout_until.load(Ordering::Acquire) {
            return Ok(());
        }
        let local = self.streamer.get_message_count()?;
        match self.acquire_lockout_and_write_message(local, local, None).await {
            Err(err @ CoordinatorError::NotChosen(_)) => {
                state.prev_chosen = None;
                Err(err)
            }
            other => other,
        }
    }

    /// Copies messages the chosen node published into the local log. Returns the new local count.
    async fn pull_messages(&self, local: u64, remote: u64) -> u64 {
        let read_until = remote.min(local.saturating_add(self.config.msg_per_poll));
        let mut messages = Vec::new();
        for pos in local..read_until {
            let raw = match self.store.get(&message_key_for(pos)).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    debug!(pos, "coordinator message not in store");
                    break;
                }
                Err(err) => {
                    warn!(pos, %err, "coordinator failed reading message");
                    break;
                }
            };
            match MessageWithMetadata::decode_from(&raw) {
                Ok(msg) => messages.push(msg),
                Err(err) => {
                    warn!(pos, %err, "coordinator failed to parse message from store");
                    break;
                }
            }
        }
        if messages.is_empty() {
            return local;
        }
        let count = messages.len() as u64;
        match self.streamer.add_messages(local, false, messages).await {
            Ok(()) => local + count,
            Err(err) => {
                warn!(%err, pos = local, count, "coordinator failed to add messages");
                local
            }
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(url = %self.config.my_url, "starting sequencer coordinator");
            loop {
                let delay = self.update().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.config.can_sequence() {
                if let Err(err) = self.release().await {
                    warn!(%err, "failed to release sequencer lockout on shutdown");
                }
            }
            info!("sequencer coordinator stopped");
        })
    }
}

#[async_trait]
impl SequencingLockout for SeqCoordinator {
    async fn sequencing_message(&self, pos: u64, msg: &MessageWithMetadata) -> anyhow::Result<()> {
        if !self.currently_chosen() {
            return Err(CoordinatorError::LockoutExpired.into());
        }
        self.acquire_lockout_and_write_message(pos, pos + 1, Some(msg)).await?;
        Ok(())
    }
}
