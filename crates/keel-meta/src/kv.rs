use async_trait::async_trait;
use serde::de::DeserializeOwned;

use keel_common::{EndpointFilter, ServingDeployment, ServingEndpoint};

use crate::endpoint_store::{DeploymentWrite, EndpointStore, StoreError};
use crate::types::{KvTxn, MetaStore};

const ENDPOINT_PREFIX: &str = "/serving/endpoints/";
const DEPLOYMENT_PREFIX: &str = "/serving/deployments/";
const ROUTE_PREFIX: &str = "/serving/routes";

fn endpoint_key(id: &str) -> String {
    format!("{ENDPOINT_PREFIX}{id}")
}

fn deployment_key(id: &str) -> String {
    format!("{DEPLOYMENT_PREFIX}{id}")
}

/// Routes start with '/', so they append directly to the prefix.
fn route_key(route: &str) -> String {
    if route.starts_with('/') {
        format!("{ROUTE_PREFIX}{route}")
    } else {
        format!("{ROUTE_PREFIX}/{route}")
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| {
        tracing::warn!(key=%key, error=%source, "corrupt record in meta store");
        StoreError::Corrupt {
            key: key.to_string(),
            source,
        }
    })
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// `EndpointStore` on top of any `MetaStore` (etcd in production, memory in tests).
///
/// Layout:
/// - `/serving/endpoints/{id}`   endpoint record
/// - `/serving/deployments/{id}` deployment record
/// - `/serving/routes{route}`    route reservation, value = endpoint id
#[derive(Debug, Clone)]
pub struct KvEndpointStore<S> {
    kv: S,
}

impl<S: MetaStore> KvEndpointStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    async fn load_endpoint(&self, id: &str) -> Result<Option<(ServingEndpoint, u64)>, StoreError> {
        let key = endpoint_key(id);
        match self.kv.get(&key).await? {
            Some((bytes, rev)) => Ok(Some((decode(&key, &bytes)?, rev))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: MetaStore> EndpointStore for KvEndpointStore<S> {
    async fn insert(&self, endpoint: &ServingEndpoint) -> Result<ServingEndpoint, StoreError> {
        let mut stored = endpoint.clone();
        stored.revision = 1;

        let ep_key = endpoint_key(&stored.id);
        let rt_key = route_key(&stored.route);
        let txn = KvTxn::new()
            .when_absent(ep_key.clone())
            .when_absent(rt_key.clone())
            .put(ep_key.clone(), encode(&ep_key, &stored)?)
            .put(rt_key, stored.id.clone().into_bytes());

        let (applied, _) = self.kv.txn(txn).await?;
        if !applied {
            return Err(StoreError::Conflict(format!(
                "endpoint id {} or route {} already exists",
                stored.id, stored.route
            )));
        }
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<ServingEndpoint>, StoreError> {
        Ok(self.load_endpoint(id).await?.map(|(ep, _)| ep))
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<ServingDeployment>, StoreError> {
        let key = deployment_key(id);
        match self.kv.get(&key).await? {
            Some((bytes, _)) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &EndpointFilter) -> Result<Vec<ServingEndpoint>, StoreError> {
        let mut out = Vec::new();
        for (key, bytes, _) in self.kv.list_prefix(ENDPOINT_PREFIX).await? {
            let ep: ServingEndpoint = decode(&key, &bytes)?;
            if filter.matches(&ep) {
                out.push(ep);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn commit(
        &self,
        endpoint: &ServingEndpoint,
        deployment: DeploymentWrite,
    ) -> Result<ServingEndpoint, StoreError> {
        let Some((current, kv_rev)) = self.load_endpoint(&endpoint.id).await? else {
            return Err(StoreError::NotFound(endpoint.id.clone()));
        };
        if current.revision != endpoint.revision {
            tracing::debug!(
                endpoint_id=%endpoint.id,
                stored = current.revision,
                given = endpoint.revision,
                "stale revision rejected"
            );
            return Err(StoreError::Conflict(format!(
                "endpoint {} changed concurrently (revision {} != {})",
                endpoint.id, current.revision, endpoint.revision
            )));
        }
        if current.route != endpoint.route {
            return Err(StoreError::Conflict(format!(
                "route of endpoint {} is immutable",
                endpoint.id
            )));
        }

        let mut stored = endpoint.clone();
        stored.revision = current.revision + 1;

        let ep_key = endpoint_key(&stored.id);
        let mut txn = KvTxn::new()
            .when_revision(ep_key.clone(), kv_rev)
            .put(ep_key.clone(), encode(&ep_key, &stored)?);
        let dep_key = deployment_key(&stored.id);
        txn = match deployment {
            DeploymentWrite::Keep => txn,
            DeploymentWrite::Put(dep) => {
                let bytes = encode(&dep_key, &dep)?;
                txn.put(dep_key, bytes)
            }
            DeploymentWrite::Remove => txn.delete(dep_key),
        };

        let (applied, _) = self.kv.txn(txn).await?;
        if !applied {
            return Err(StoreError::Conflict(format!(
                "endpoint {} changed concurrently",
                stored.id
            )));
        }
        Ok(stored)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let Some((current, kv_rev)) = self.load_endpoint(id).await? else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let ep_key = endpoint_key(id);
        let txn = KvTxn::new()
            .when_revision(ep_key.clone(), kv_rev)
            .delete(ep_key)
            .delete(deployment_key(id))
            .delete(route_key(&current.route));

        let (applied, _) = self.kv.txn(txn).await?;
        if !applied {
            return Err(StoreError::Conflict(format!(
                "endpoint {id} changed concurrently"
            )));
        }
        Ok(())
    }
}
