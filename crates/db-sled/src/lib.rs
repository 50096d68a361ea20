//! [`Database`] backed by sled. Batches are applied atomically and flushed before `write` returns.

use std::ops::Bound;
use std::path::Path;

use rollup_inbox::db::{Batch as DbBatch, Database as DbDatabase, Iterator as DbIterator};

#[derive(Clone)]
pub struct SledDb {
    db: sled::Db,
}

impl SledDb {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database that disappears when dropped.
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

struct SledBatch {
    tree: sled::Db,
    batch: sled::Batch,
}

impl DbBatch for SledBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.batch.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> anyhow::Result<()> {
        self.batch.remove(key);
        Ok(())
    }

    fn write(self: Box<Self>) -> anyhow::Result<()> {
        let SledBatch { tree, batch } = *self;
        tree.apply_batch(batch)?;
        tree.flush()?;
        Ok(())
    }
}

/// Walks a prefix by re-seeking past the last returned key, so it never pins a snapshot.
struct SledIter {
    tree: sled::Db,
    prefix: Vec<u8>,
    lower: Bound<Vec<u8>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    error: Option<String>,
}

impl DbIterator for SledIter {
    fn next(&mut self) -> bool {
        let lower = std::mem::replace(&mut self.lower, Bound::Unbounded);
        match self.tree.range::<Vec<u8>, _>((lower, Bound::Unbounded)).next() {
            Some(Ok((k, v))) if k.starts_with(&self.prefix) => {
                self.lower = Bound::Excluded(k.to_vec());
                self.current = Some((k.to_vec(), v.to_vec()));
                true
            }
            Some(Err(e)) => {
                self.error = Some(e.to_string());
                self.current = None;
                false
            }
            _ => {
                self.current = None;
                false
            }
        }
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or_default()
    }

    fn error(&self) -> Option<anyhow::Error> {
        self.error.as_ref().map(|e| anyhow::anyhow!("sled iterator: {e}"))
    }

    fn release(self: Box<Self>) {}
}

impl DbDatabase for SledDb {
    fn has(&self, key: &[u8]) -> anyhow::Result<bool> {
        Ok(self.db.contains_key(key)?)
    }

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn new_batch(&self) -> Box<dyn DbBatch> {
        Box::new(SledBatch { tree: self.db.clone(), batch: sled::Batch::default() })
    }

    fn new_iterator(&self, prefix: &[u8], start: &[u8]) -> Box<dyn DbIterator> {
        let mut key = Vec::with_capacity(prefix.len() + start.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(start);
        Box::new(SledIter {
            tree: self.db.clone(),
            prefix: prefix.to_vec(),
            lower: Bound::Included(key),
            current: None,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterator_stays_within_prefix() {
        let db = SledDb::temporary().unwrap();
        for (k, v) in [(&b"a\x01"[..], b"1"), (b"a\x02", b"2"), (b"a\x03", b"3"), (b"b\x00", b"x")] {
            db.put(k, v).unwrap();
        }
        let mut it = db.new_iterator(b"a", &[0x02]);
        let mut seen = Vec::new();
        while it.next() {
            seen.push((it.key().to_vec(), it.value().to_vec()));
        }
        assert!(it.error().is_none());
        assert_eq!(seen, vec![(b"a\x02".to_vec(), b"2".to_vec()), (b"a\x03".to_vec(), b"3".to_vec())]);
    }

    #[test]
    fn batch_is_invisible_until_written() {
        let db = SledDb::temporary().unwrap();
        db.put(b"gone", b"1").unwrap();
        let mut batch = db.new_batch();
        batch.put(b"k", b"v").unwrap();
        batch.delete(b"gone").unwrap();
        assert_eq!(db.get(b"k").unwrap(), None);
        assert!(db.has(b"gone").unwrap());
        batch.write().unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(!db.has(b"gone").unwrap());
    }
}
