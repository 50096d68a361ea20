/// Writes staged against a [`Database`]; nothing is visible until [`Batch::write`] commits them atomically.
pub trait Batch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&mut self, key: &[u8]) -> anyhow::Result<()>;
    fn write(self: Box<Self>) -> anyhow::Result<()>;
}

/// Forward iterator over keys sharing a prefix.
pub trait Iterator: Send {
    fn next(&mut self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
    fn error(&self) -> Option<anyhow::Error>;
    fn release(self: Box<Self>);
}

pub trait Database: Send + Sync {
    fn has(&self, key: &[u8]) -> anyhow::Result<bool>;
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn new_batch(&self) -> Box<dyn Batch>;
    /// Iterates keys `prefix ‖ k` with `k >= start`, in ascending order.
    fn new_iterator(&self, prefix: &[u8], start: &[u8]) -> Box<dyn Iterator>;
}
