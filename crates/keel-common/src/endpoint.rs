use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deployment_spec::DeploymentSpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Stg,
    Prod,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Stg, Environment::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Stg => "stg",
            Environment::Prod => "prod",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Environment::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a serving endpoint.
///
/// `deploying -> {healthy, degraded, failed}`, `healthy/degraded/rollback -> deploying`
/// on redeploy, `healthy/degraded/failed -> rollback -> healthy`; any state
/// `-> deleted` once the endpoint lock is held.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Deploying,
    Healthy,
    Degraded,
    Failed,
    Rollback,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Deploying => "deploying",
            EndpointStatus::Healthy => "healthy",
            EndpointStatus::Degraded => "degraded",
            EndpointStatus::Failed => "failed",
            EndpointStatus::Rollback => "rollback",
        }
    }

    /// `rollback` is included so an endpoint whose rollback never became
    /// ready can be moved forward again.
    pub fn can_redeploy(&self) -> bool {
        matches!(
            self,
            EndpointStatus::Healthy | EndpointStatus::Degraded | EndpointStatus::Rollback
        )
    }

    pub fn can_rollback(&self) -> bool {
        matches!(
            self,
            EndpointStatus::Healthy | EndpointStatus::Degraded | EndpointStatus::Failed
        )
    }

    /// States a health probe is allowed to move between.
    pub fn is_probe_managed(&self) -> bool {
        matches!(
            self,
            EndpointStatus::Deploying | EndpointStatus::Healthy | EndpointStatus::Degraded
        )
    }
}

impl FromStr for EndpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(EndpointStatus::Deploying),
            "healthy" => Ok(EndpointStatus::Healthy),
            "degraded" => Ok(EndpointStatus::Degraded),
            "failed" => Ok(EndpointStatus::Failed),
            "rollback" => Ok(EndpointStatus::Rollback),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU / memory quantities in Kubernetes notation ("500m", "4Gi").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceQuantities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

impl ResourceQuantities {
    /// Fields set on `self` win; unset fields are taken from `defaults`.
    pub fn or_defaults(&self, defaults: &ResourceQuantities) -> ResourceQuantities {
        ResourceQuantities {
            cpu_request: self.cpu_request.clone().or_else(|| defaults.cpu_request.clone()),
            cpu_limit: self.cpu_limit.clone().or_else(|| defaults.cpu_limit.clone()),
            memory_request: self
                .memory_request
                .clone()
                .or_else(|| defaults.memory_request.clone()),
            memory_limit: self
                .memory_limit
                .clone()
                .or_else(|| defaults.memory_limit.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_request.is_none()
            && self.cpu_limit.is_none()
            && self.memory_request.is_none()
            && self.memory_limit.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AutoscalePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_latency_ms: Option<u32>,
    /// Target GPU utilisation percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<u32>,
    /// Target CPU utilisation percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_utilization: Option<u32>,
}

/// Snapshot of the configuration an endpoint ran with before its last
/// successful mutation. Enough to recreate the prior resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPlan {
    pub runtime_image: Option<String>,
    pub use_gpu: bool,
    pub requested_resources: ResourceQuantities,
    pub resources: ResourceQuantities,
    pub min_replicas: u32,
    pub max_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale_policy: Option<AutoscalePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_spec: Option<DeploymentSpec>,
    pub captured_at: DateTime<Utc>,
}

/// Desired and observed state of one inference endpoint.
///
/// Persisted by the endpoint store; only the reconciliation engine writes the
/// lifecycle fields. `revision` increases on every committed write and is used
/// for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServingEndpoint {
    /// Immutable primary key.
    pub id: String,

    /// Model catalog entry. Existence is the caller's concern.
    pub model_entry_id: String,

    pub environment: Environment,

    /// Unique request path, e.g. "/v1/models/support-bot".
    pub route: String,

    pub status: EndpointStatus,

    /// Last failure reason, kept while the endpoint is degraded or failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,

    pub min_replicas: u32,
    pub max_replicas: u32,

    /// Resolved container image. None until the image policy has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image: Option<String>,

    #[serde(default)]
    pub use_gpu: bool,

    /// Quantities the caller asked for explicitly.
    #[serde(default)]
    pub requested_resources: ResourceQuantities,

    /// Effective quantities after profile defaults were applied.
    #[serde(default)]
    pub resources: ResourceQuantities,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale_policy: Option<AutoscalePolicy>,

    /// When present, authoritative over the ad-hoc GPU/image fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_spec: Option<DeploymentSpec>,

    /// Selects the framework adapter, e.g. "kubernetes", "kserve", "ray".
    pub serving_framework: String,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_plan: Option<RollbackPlan>,

    #[serde(default)]
    pub revision: u64,
}

impl ServingEndpoint {
    pub fn snapshot(&self) -> RollbackPlan {
        RollbackPlan {
            runtime_image: self.runtime_image.clone(),
            use_gpu: self.use_gpu,
            requested_resources: self.requested_resources.clone(),
            resources: self.resources.clone(),
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            autoscale_policy: self.autoscale_policy.clone(),
            deployment_spec: self.deployment_spec.clone(),
            captured_at: Utc::now(),
        }
    }

    pub fn set_status(&mut self, status: EndpointStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
    }
}
