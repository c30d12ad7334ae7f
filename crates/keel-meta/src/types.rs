use anyhow::Result;
use async_trait::async_trait;

/// A conditional multi-key write.
///
/// Every `(key, revision)` in `compares` must match the key's current mod
/// revision (0 = key absent) for the puts and deletes to be applied. Either
/// all operations land or none do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvTxn {
    pub compares: Vec<(String, u64)>,
    pub puts: Vec<(String, Vec<u8>)>,
    pub deletes: Vec<String>,
}

impl KvTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when_revision(mut self, key: impl Into<String>, revision: u64) -> Self {
        self.compares.push((key.into(), revision));
        self
    }

    pub fn when_absent(self, key: impl Into<String>) -> Self {
        self.when_revision(key, 0)
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.puts.push((key.into(), value));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.deletes.push(key.into());
        self
    }
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Returns the value and its mod revision.
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Returns `(applied, revision)`; `revision` is the store revision after a
    /// successful commit, or 0 when the compares failed.
    async fn txn(&self, txn: KvTxn) -> Result<(bool, u64)>;
}
