pub mod cluster;
pub mod kserve;
pub mod kubernetes;
pub mod ray;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use keel_common::{AutoscalePolicy, ResourceQuantities, ResourceRef, Rollout};

pub use kserve::KServeAdapter;
pub use kubernetes::KubernetesAdapter;
pub use ray::RayServeAdapter;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Network failure, timeout, throttling or a 5xx. Safe to retry.
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// The cluster refused the object (validation, quota, webhook).
    #[error("permanent cluster error: {0}")]
    Permanent(String),

    #[error("resource {0} not found")]
    NotFound(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadResources {
    pub quantities: ResourceQuantities,
    /// Accelerators per replica; 0 for CPU-only.
    pub gpus: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingSpec {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub autoscale: Option<AutoscalePolicy>,
}

/// Everything an adapter needs to materialise an endpoint on the cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadRequest {
    pub endpoint_id: String,
    pub namespace: String,
    pub image: String,
    pub resources: WorkloadResources,
    pub scaling: ScalingSpec,
    pub route: String,
    pub rollout: Option<Rollout>,
    pub model_ref: Option<String>,
}

impl WorkloadRequest {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            namespace: self.namespace.clone(),
            name: resource_name(&self.endpoint_id),
        }
    }
}

/// Partial update; `None` leaves that aspect of the workload as it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkloadUpdate {
    pub image: Option<String>,
    pub resources: Option<WorkloadResources>,
    pub scaling: Option<ScalingSpec>,
    pub rollout: Option<Rollout>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameworkStatus {
    pub replica_count: u32,
    pub ready_replicas: u32,
    pub conditions: Vec<StatusCondition>,
    pub raw_status: serde_json::Value,
}

impl FrameworkStatus {
    pub fn is_ready(&self) -> bool {
        self.ready_replicas > 0
    }
}

/// Uniform create/update/status/delete contract over a serving backend.
#[async_trait]
pub trait FrameworkAdapter: Send + Sync {
    /// Framework identifier stored on the endpoint, e.g. "kubernetes".
    fn framework(&self) -> &str;

    /// Create or converge the workload. Calling twice for the same endpoint
    /// id yields the same resource.
    async fn create(&self, req: &WorkloadRequest) -> Result<ResourceRef, AdapterError>;

    /// Update in place; never recreates. `NotFound` when the resource is gone.
    async fn update(&self, target: &ResourceRef, update: &WorkloadUpdate)
        -> Result<(), AdapterError>;

    /// Single read, no retries.
    async fn fetch_status(&self, target: &ResourceRef) -> Result<FrameworkStatus, AdapterError>;

    /// Returns only once the API server no longer has the resource.
    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError>;
}

/// Adapters keyed by framework name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn FrameworkAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn FrameworkAdapter>) {
        self.adapters.insert(adapter.framework().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn FrameworkAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, framework: &str) -> Option<Arc<dyn FrameworkAdapter>> {
        self.adapters.get(framework).cloned()
    }

    pub fn frameworks(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

const NAME_PREFIX: &str = "keel-";
const NAME_MAX: usize = 63;
const HASH_LEN: usize = 8;

/// Deterministic DNS-1123 name for an endpoint's cluster objects:
/// `keel-<sanitised id>-<sha256 prefix of the raw id>`. The hash keeps ids
/// that sanitise to the same text ("ep.a", "ep_a", "EP-A") apart.
pub fn resource_name(endpoint_id: &str) -> String {
    let mut readable = String::new();
    let mut prev_dash = true;
    for c in endpoint_id.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            readable.push(c);
            prev_dash = false;
        } else if !prev_dash {
            readable.push('-');
            prev_dash = true;
        }
    }
    readable.truncate(NAME_MAX - NAME_PREFIX.len() - HASH_LEN - 1);
    let readable = readable.trim_end_matches('-');

    let mut hasher = Sha256::new();
    hasher.update(endpoint_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let hash = &digest[..HASH_LEN];

    if readable.is_empty() {
        format!("{NAME_PREFIX}{hash}")
    } else {
        format!("{NAME_PREFIX}{readable}-{hash}")
    }
}
