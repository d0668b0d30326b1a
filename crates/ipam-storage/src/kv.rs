use crate::Result;
use bytes::Bytes;

/// Key-value store trait. C3's pool store and C4's overlap registry are
/// both thin typed layers over this.
pub trait KVStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;
    fn exists(&self, key: &[u8]) -> Result<bool>;

    /// Begin a transaction. The returned transaction is backed by a single
    /// writer lock (redb's write-transaction semantics), which is what makes
    /// a read-compare-write sequence inside one transaction a genuine
    /// compare-and-swap rather than a race.
    fn transaction(&self) -> Result<Box<dyn Transaction>>;

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Bytes>>;
}

/// Transaction trait for atomic operations.
pub trait Transaction: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}
