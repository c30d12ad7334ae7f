//! Helpers shared by the Kubernetes-backed adapters.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, PatchParams};
use kube::discovery::ApiResource;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{AdapterError, StatusCondition, WorkloadResources};

pub const FIELD_MANAGER: &str = "keel-reconciler";
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const ENDPOINT_LABEL: &str = "keel.io/endpoint";

/// Server-side apply with ownership takeover, so re-applying converges.
pub fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

pub fn labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), "keel".to_string()),
        (ENDPOINT_LABEL.to_string(), name.to_string()),
    ])
}

pub fn api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: format!("{group}/{version}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Map a kube error onto the adapter taxonomy.
pub fn classify(err: kube::Error, what: &str) -> AdapterError {
    match err {
        kube::Error::Api(e) => match e.code {
            404 => AdapterError::NotFound(what.to_string()),
            409 | 429 => AdapterError::Transient(format!("{what}: {}", e.message)),
            c if c >= 500 => AdapterError::Transient(format!("{what}: {} ({c})", e.message)),
            c => AdapterError::Permanent(format!("{what}: {} ({c}, {})", e.message, e.reason)),
        },
        kube::Error::SerdeError(e) => AdapterError::Permanent(format!("{what}: {e}")),
        other => AdapterError::Transient(format!("{what}: {other}")),
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

fn quantity_map(cpu: &Option<String>, memory: &Option<String>, gpus: u32) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(mem) = memory {
        map.insert("memory".to_string(), Quantity(mem.clone()));
    }
    if gpus > 0 {
        map.insert(GPU_RESOURCE.to_string(), Quantity(gpus.to_string()));
    }
    map
}

pub fn resource_requirements(res: &WorkloadResources) -> ResourceRequirements {
    let q = &res.quantities;
    let requests = quantity_map(&q.cpu_request, &q.memory_request, res.gpus);
    let limits = quantity_map(&q.cpu_limit, &q.memory_limit, res.gpus);
    ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    }
}

/// Same shape as [`resource_requirements`], for custom resources built as JSON.
pub fn resources_json(res: &WorkloadResources) -> Value {
    let to_json = |m: BTreeMap<String, Quantity>| -> Value {
        m.into_iter().map(|(k, v)| (k, Value::String(v.0))).collect()
    };
    let q = &res.quantities;
    json!({
        "requests": to_json(quantity_map(&q.cpu_request, &q.memory_request, res.gpus)),
        "limits": to_json(quantity_map(&q.cpu_limit, &q.memory_limit, res.gpus)),
    })
}

/// Read `status.conditions` from a raw status document.
pub fn conditions_from(status: &Value) -> Vec<StatusCondition> {
    let Some(items) = status.get("conditions").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|c| {
            Some(StatusCondition {
                type_: c.get("type")?.as_str()?.to_string(),
                status: c.get("status")?.as_str()?.to_string(),
                reason: c.get("reason").and_then(Value::as_str).map(String::from),
                message: c.get("message").and_then(Value::as_str).map(String::from),
            })
        })
        .collect()
}

pub fn condition_true(conditions: &[StatusCondition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "True")
}

/// Polling budget for delete confirmation. Copies share one deadline, so an
/// adapter removing several objects waits at most `timeout` in total.
#[derive(Debug, Clone, Copy)]
pub struct DeleteConfirm {
    pub poll_interval: Duration,
    pub timeout: Duration,
    deadline: Instant,
}

impl DeleteConfirm {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Issue a delete and block until the object is gone.
///
/// Returns `Ok(false)` when the object did not exist to begin with. An object
/// still present once `confirm`'s deadline has passed is reported as transient.
pub async fn delete_confirmed<K>(
    api: &Api<K>,
    name: &str,
    kind: &str,
    confirm: DeleteConfirm,
) -> Result<bool, AdapterError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let what = format!("{kind} {name}");
    match api.delete(name, &DeleteParams::foreground()).await {
        Ok(_) => debug!(object = %what, "delete accepted"),
        Err(e) if is_not_found(&e) => return Ok(false),
        Err(e) => return Err(classify(e, &what)),
    }

    loop {
        match api.get_opt(name).await {
            Ok(None) => return Ok(true),
            Ok(Some(_)) => trace!(object = %what, "still terminating"),
            Err(e) if is_not_found(&e) => return Ok(true),
            Err(e) => trace!(object = %what, error = %e, "delete confirmation read failed"),
        }
        if confirm.expired() {
            return Err(AdapterError::Transient(format!(
                "{what} not confirmed deleted after {}s",
                confirm.timeout.as_secs()
            )));
        }
        tokio::time::sleep(confirm.poll_interval).await;
    }
}
