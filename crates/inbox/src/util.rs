use alloy_rlp::Decodable;

use crate::db::{Batch, Database};

/// Stages deletion of every key under `prefix` at or after `start`.
pub fn delete_starting_at<D: Database + ?Sized>(
    db: &D,
    batch: &mut dyn Batch,
    prefix: &[u8],
    start: &[u8],
) -> anyhow::Result<()> {
    let mut it = db.new_iterator(prefix, start);
    while it.next() {
        batch.delete(it.key())?;
    }
    if let Some(err) = it.error() {
        return Err(err);
    }
    it.release();
    Ok(())
}

/// Reads an RLP-encoded counter, `None` if the key was never written.
pub fn read_count<D: Database + ?Sized>(db: &D, key: &[u8]) -> anyhow::Result<Option<u64>> {
    match db.get(key)? {
        Some(data) => Ok(Some(u64::decode(&mut data.as_slice())?)),
        None => Ok(None),
    }
}

pub fn write_count(batch: &mut dyn Batch, key: &[u8], count: u64) -> anyhow::Result<()> {
    batch.put(key, &alloy_rlp::encode(count))
}
