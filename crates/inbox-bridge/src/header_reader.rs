use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::Notify;
use tokio::time::{self, Duration};
use tracing::warn;

use crate::rpc::{BlockTag, RpcClient};
use crate::traits::{L1Header, L1HeaderReader};

/// Header reader that polls `eth_getBlockByNumber`.
pub struct HttpHeaderReader {
    rpc: Arc<RpcClient>,
    poll_interval_ms: u64,
    stop: Arc<Notify>,
}

impl HttpHeaderReader {
    pub fn new(rpc: Arc<RpcClient>, poll_interval_ms: u64) -> Self {
        Self { rpc, poll_interval_ms, stop: Arc::new(Notify::new()) }
    }
}

#[async_trait]
impl L1HeaderReader for HttpHeaderReader {
    async fn last_header(&self) -> Result<L1Header> {
        let number = self.rpc.block_number(BlockTag::Latest).await?;
        Ok(L1Header { number })
    }

    async fn latest_safe_block_nr(&self) -> Result<u64> {
        self.rpc.block_number(BlockTag::Safe).await
    }

    async fn latest_finalized_block_nr(&self) -> Result<u64> {
        self.rpc.block_number(BlockTag::Finalized).await
    }

    async fn subscribe(&self) -> (Receiver<L1Header>, Box<dyn FnOnce() + Send>) {
        // Capacity 1: a slow consumer only ever sees the newest head.
        let (tx, rx) = mpsc::channel(1);
        let rpc = self.rpc.clone();
        let stop = self.stop.clone();
        let interval = self.poll_interval_ms;
        let unsub = {
            let stop = self.stop.clone();
            Box::new(move || stop.notify_waiters()) as Box<dyn FnOnce() + Send>
        };
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_millis(interval));
            let mut last: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = stop.notified() => break,
                }
                match rpc.block_number(BlockTag::Latest).await {
                    Ok(n) if n > last => {
                        last = n;
                        if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(L1Header { number: n }) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "failed to poll L1 head"),
                }
            }
        });
        (rx, unsub)
    }
}
