use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::deployment_spec::DeploymentSpec;
use crate::endpoint::{AutoscalePolicy, EndpointStatus, Environment, ResourceQuantities};

/// Catalog metadata the caller attaches about the model being served.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModelMetadata {
    /// HuggingFace model id, e.g. "mistralai/Mistral-7B-Instruct-v0.3".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployRequest {
    /// Caller-chosen id. Generated when absent; reusing an id makes the call idempotent.
    #[serde(default)]
    pub id: Option<String>,

    pub model_entry_id: String,
    pub environment: Environment,
    pub route: String,

    #[serde(default = "default_replicas")]
    pub min_replicas: u32,
    #[serde(default = "default_replicas")]
    pub max_replicas: u32,

    /// Explicit image override, used verbatim.
    #[serde(default)]
    pub runtime_image: Option<String>,

    /// Ignored when `deployment_spec` is present.
    #[serde(default)]
    pub use_gpu: Option<bool>,

    #[serde(default)]
    pub resources: ResourceQuantities,

    #[serde(default)]
    pub autoscale_policy: Option<AutoscalePolicy>,

    #[serde(default)]
    pub deployment_spec: Option<DeploymentSpec>,

    /// Falls back to the per-environment default when absent.
    #[serde(default)]
    pub serving_framework: Option<String>,

    #[serde(default)]
    pub model_metadata: Option<ModelMetadata>,
}

fn default_replicas() -> u32 {
    1
}

/// A redeploy field: keep the stored value, or replace it.
///
/// Absent and `null` both decode to `Keep`, so "not provided" is never
/// confused with `false`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Override<T> {
    #[default]
    Keep,
    Set(T),
}

impl<T> Override<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Override::Keep)
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Override::Keep => None,
            Override::Set(v) => Some(v),
        }
    }
}

impl<T: Clone> Override<T> {
    pub fn resolve(&self, current: &T) -> T {
        match self {
            Override::Keep => current.clone(),
            Override::Set(v) => v.clone(),
        }
    }
}

impl<T> From<Option<T>> for Override<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Override::Set(v),
            None => Override::Keep,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Override<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Override::from)
    }
}

impl<T: Serialize> Serialize for Override<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_set().serialize(serializer)
    }
}

/// Partial changes for a redeploy. Every field defaults to `Keep`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RedeployOverrides {
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub use_gpu: Override<bool>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub runtime_image: Override<String>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub cpu_request: Override<String>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub cpu_limit: Override<String>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub memory_request: Override<String>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub memory_limit: Override<String>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub deployment_spec: Override<DeploymentSpec>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub min_replicas: Override<u32>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub max_replicas: Override<u32>,
    #[serde(default, skip_serializing_if = "Override::is_keep")]
    pub autoscale_policy: Override<AutoscalePolicy>,
}

impl RedeployOverrides {
    /// Overlay explicitly set quantities on top of `current`.
    pub fn apply_resources(&self, current: &ResourceQuantities) -> ResourceQuantities {
        let pick = |o: &Override<String>, cur: &Option<String>| match o {
            Override::Keep => cur.clone(),
            Override::Set(v) => Some(v.clone()),
        };
        ResourceQuantities {
            cpu_request: pick(&self.cpu_request, &current.cpu_request),
            cpu_limit: pick(&self.cpu_limit, &current.cpu_limit),
            memory_request: pick(&self.memory_request, &current.memory_request),
            memory_limit: pick(&self.memory_limit, &current.memory_limit),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EndpointFilter {
    #[serde(default)]
    pub environment: Option<Environment>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub status: Option<EndpointStatus>,
}

impl EndpointFilter {
    pub fn matches(&self, ep: &crate::ServingEndpoint) -> bool {
        self.environment.map_or(true, |e| e == ep.environment)
            && self
                .model_id
                .as_deref()
                .map_or(true, |m| m == ep.model_entry_id)
            && self.status.map_or(true, |s| s == ep.status)
    }
}
