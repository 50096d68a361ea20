use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("coordination store poisoned")]
    Poisoned,
}

/// A write applied by [`CoordinationStore::commit_if_unchanged`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Set { key: String, value: Vec<u8>, ttl: Duration },
    Del { key: String },
}

impl StoreOp {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self::Set { key: key.into(), value: value.into(), ttl }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }
}

/// Shared key/value medium the coordinators elect through. Every key carries a lease.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Applies `ops` atomically if every key in `expected` still holds the given value
    /// (`None` meaning absent). Returns `false` without writing otherwise.
    async fn commit_if_unchanged(
        &self,
        expected: &[(&str, Option<Vec<u8>>)],
        ops: Vec<StoreOp>,
    ) -> Result<bool, StoreError>;
}

/// Coordination through a redis server using WATCH/MULTI/EXEC.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.pset_ex(key, value, ttl_millis(ttl)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn commit_if_unchanged(
        &self,
        expected: &[(&str, Option<Vec<u8>>)],
        ops: Vec<StoreOp>,
    ) -> Result<bool, StoreError> {
        // WATCH state is per connection, so transactions get their own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let keys: Vec<&str> = expected.iter().map(|(k, _)| *k).collect();
        let _: () = redis::cmd("WATCH").arg(&keys).query_async(&mut conn).await?;
        for (key, want) in expected {
            let current: Option<Vec<u8>> = conn.get(*key).await?;
            if current != *want {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Ok(false);
            }
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::Set { key, value, ttl } => {
                    pipe.cmd("SET").arg(key).arg(value).arg("PX").arg(ttl_millis(ttl)).ignore();
                }
                StoreOp::Del { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        let committed: Option<()> = pipe.query_async(&mut conn).await?;
        Ok(committed.is_some())
    }
}

/// In-process store with the same lease semantics, for single-host fleets and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(entries: &HashMap<String, (Vec<u8>, Instant)>, key: &str, now: Instant) -> Option<Vec<u8>> {
        entries.get(key).filter(|(_, expires)| *expires > now).map(|(v, _)| v.clone())
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(Self::live(&entries, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn commit_if_unchanged(
        &self,
        expected: &[(&str, Option<Vec<u8>>)],
        ops: Vec<StoreOp>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Instant::now();
        if expected.iter().any(|(key, want)| Self::live(&entries, key, now) != *want) {
            return Ok(false);
        }
        for op in ops {
            match op {
                StoreOp::Set { key, value, ttl } => {
                    entries.insert(key, (value, now + ttl));
                }
                StoreOp::Del { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(true)
    }
}
