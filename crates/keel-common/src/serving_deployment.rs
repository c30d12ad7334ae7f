use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::{AutoscalePolicy, ResourceQuantities};

/// Address of a framework resource on the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Framework-observed state of a deployed endpoint.
///
/// One-to-one with an endpoint whose cluster resource exists. Written only
/// after the resource was created and removed together with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServingDeployment {
    pub endpoint_id: String,
    pub serving_framework: String,
    pub framework_resource_id: String,
    pub framework_namespace: String,

    pub replica_count: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscaling_metrics: Option<AutoscalePolicy>,

    #[serde(default)]
    pub resource_requests: ResourceQuantities,

    #[serde(default)]
    pub resource_limits: ResourceQuantities,

    /// Raw status document as reported by the framework.
    #[serde(default)]
    pub framework_status: serde_json::Value,

    pub updated_at: DateTime<Utc>,
}

impl ServingDeployment {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef {
            namespace: self.framework_namespace.clone(),
            name: self.framework_resource_id.clone(),
        }
    }
}
