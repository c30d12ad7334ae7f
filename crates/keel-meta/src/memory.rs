use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::{KvTxn, MetaStore};

/// In-process `MetaStore` with etcd-like revision semantics.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let out = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect();
        Ok(out)
    }

    async fn txn(&self, txn: KvTxn) -> Result<(bool, u64)> {
        let mut inner = self.inner.write().await;

        let guards_hold = txn.compares.iter().all(|(key, expected)| {
            let current = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            current == *expected
        });
        if !guards_hold {
            return Ok((false, 0));
        }

        // One revision per transaction, as etcd does.
        inner.revision = inner.revision.saturating_add(1);
        let rev = inner.revision;
        for key in txn.deletes {
            inner.kv.remove(&key);
        }
        for (key, value) in txn.puts {
            inner.kv.insert(key, (value, rev));
        }
        Ok((true, rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn txn_applies_all_or_nothing() {
        let store = MemoryMetaStore::new();
        let (ok, rev) = store
            .txn(
                KvTxn::new()
                    .when_absent("/a")
                    .put("/a", b"1".to_vec())
                    .put("/b", b"2".to_vec()),
            )
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(store.get("/a").await.unwrap(), Some((b"1".to_vec(), rev)));

        // stale guard on /a: nothing is written, /b is not deleted
        let (ok, _) = store
            .txn(
                KvTxn::new()
                    .when_absent("/a")
                    .put("/c", b"3".to_vec())
                    .delete("/b"),
            )
            .await
            .unwrap();
        assert!(!ok);
        assert!(store.get("/c").await.unwrap().is_none());
        assert!(store.get("/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_prefix_stops_at_prefix_boundary() {
        let store = MemoryMetaStore::new();
        store
            .txn(
                KvTxn::new()
                    .put("/serving/endpoints/a", vec![])
                    .put("/serving/endpoints/b", vec![])
                    .put("/serving/routes/x", vec![]),
            )
            .await
            .unwrap();

        let keys: Vec<String> = store
            .list_prefix("/serving/endpoints/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["/serving/endpoints/a", "/serving/endpoints/b"]);
    }
}
