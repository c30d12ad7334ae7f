use std::sync::Arc;

use anyhow::Result;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use tokio::sync::Mutex;

use crate::types::{KvTxn, MetaStore};

#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        let kv = match resp.kvs().first() {
            Some(kv) => kv,
            None => return Ok(None),
        };
        Ok(Some((kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let opts = GetOptions::new().with_prefix();
        let resp = cli.get(prefix, Some(opts)).await?;

        let mut out = Vec::new();
        for kv in resp.kvs() {
            let k = String::from_utf8_lossy(kv.key()).to_string();
            out.push((k, kv.value().to_vec(), kv.mod_revision() as u64));
        }
        Ok(out)
    }

    async fn txn(&self, txn: KvTxn) -> Result<(bool, u64)> {
        let mut cli = self.client.lock().await;

        // mod_revision == 0 matches a key that does not exist
        let compares: Vec<Compare> = txn
            .compares
            .iter()
            .map(|(key, rev)| Compare::mod_revision(key.as_str(), CompareOp::Equal, *rev as i64))
            .collect();

        let mut ops: Vec<TxnOp> = txn
            .deletes
            .iter()
            .map(|key| TxnOp::delete(key.as_str(), None))
            .collect();
        ops.extend(
            txn.puts
                .into_iter()
                .map(|(key, value)| TxnOp::put(key, value, None)),
        );

        let resp = cli
            .txn(Txn::new().when(compares).and_then(ops).or_else([]))
            .await?;

        if !resp.succeeded() {
            return Ok((false, 0));
        }
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok((true, rev as u64))
    }
}
