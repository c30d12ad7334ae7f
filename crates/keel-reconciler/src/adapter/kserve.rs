//! KServe backend: one `InferenceService` per endpoint.

use std::sync::OnceLock;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use keel_common::config::ClusterSettings;
use keel_common::{ResourceRef, RolloutStrategy};

use super::cluster::{
    api_resource, apply_params, classify, condition_true, conditions_from, delete_confirmed,
    labels, resources_json, DeleteConfirm,
};
use super::{
    AdapterError, FrameworkAdapter, FrameworkStatus, ScalingSpec, WorkloadRequest, WorkloadUpdate,
};

pub const FRAMEWORK: &str = "kserve";
const CONTAINER_NAME: &str = "kserve-container";
const ROUTE_ANNOTATION: &str = "keel.io/route";

fn isvc_resource() -> &'static ApiResource {
    static AR: OnceLock<ApiResource> = OnceLock::new();
    AR.get_or_init(|| {
        api_resource(
            "serving.kserve.io",
            "v1beta1",
            "InferenceService",
            "inferenceservices",
        )
    })
}

pub struct KServeAdapter {
    client: Client,
    settings: ClusterSettings,
}

impl KServeAdapter {
    pub fn new(client: Client, settings: ClusterSettings) -> Self {
        Self { client, settings }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, isvc_resource())
    }
}

fn scaling_fields(predictor: &mut Value, scaling: &ScalingSpec) {
    predictor["minReplicas"] = json!(scaling.min_replicas);
    predictor["maxReplicas"] = json!(scaling.max_replicas);
    let policy = scaling.autoscale.as_ref();
    if let Some(cpu) = policy.and_then(|p| p.cpu_utilization) {
        predictor["scaleMetric"] = json!("cpu");
        predictor["scaleTarget"] = json!(cpu);
    } else if let Some(latency) = policy.and_then(|p| p.target_latency_ms) {
        // Knative concurrency is the closest proxy KServe offers for latency.
        predictor["scaleMetric"] = json!("concurrency");
        predictor["scaleTarget"] = json!((1000 / latency.max(1)).max(1));
    } else if let Some(obj) = predictor.as_object_mut() {
        obj.remove("scaleMetric");
        obj.remove("scaleTarget");
    }
}

fn canary_percent(rollout: Option<&keel_common::Rollout>) -> Option<u32> {
    let rollout = rollout?;
    if rollout.strategy != RolloutStrategy::Canary {
        return None;
    }
    rollout.traffic_split.map(|s| s.new)
}

pub fn build_inference_service(req: &WorkloadRequest, container_port: u16) -> DynamicObject {
    let target = req.resource_ref();

    let mut env = vec![json!({"name": "KEEL_ENDPOINT_ID", "value": req.endpoint_id})];
    if let Some(model_ref) = &req.model_ref {
        env.push(json!({"name": "MODEL_REF", "value": model_ref}));
    }

    let mut predictor = json!({
        "containers": [{
            "name": CONTAINER_NAME,
            "image": req.image,
            "ports": [{"containerPort": container_port, "protocol": "TCP"}],
            "env": env,
            "resources": resources_json(&req.resources),
        }]
    });
    scaling_fields(&mut predictor, &req.scaling);
    if let Some(pct) = canary_percent(req.rollout.as_ref()) {
        predictor["canaryTrafficPercent"] = json!(pct);
    }

    let mut obj = DynamicObject::new(&target.name, isvc_resource())
        .within(&target.namespace)
        .data(json!({ "spec": { "predictor": predictor } }));
    obj.metadata.labels = Some(labels(&target.name));
    obj.metadata.annotations = Some(
        [(ROUTE_ANNOTATION.to_string(), req.route.clone())]
            .into_iter()
            .collect(),
    );
    obj
}

/// Apply a partial update to a fetched InferenceService body.
pub fn apply_update(data: &mut Value, update: &WorkloadUpdate) -> Result<(), AdapterError> {
    let predictor = data
        .pointer_mut("/spec/predictor")
        .ok_or_else(|| AdapterError::Permanent("InferenceService has no spec.predictor".into()))?;

    if update.image.is_some() || update.resources.is_some() {
        let container = predictor
            .pointer_mut("/containers/0")
            .ok_or_else(|| AdapterError::Permanent("predictor has no container".into()))?;
        if let Some(image) = &update.image {
            container["image"] = json!(image);
        }
        if let Some(res) = &update.resources {
            container["resources"] = resources_json(res);
        }
    }
    if let Some(scaling) = &update.scaling {
        scaling_fields(predictor, scaling);
    }
    if let Some(obj) = predictor.as_object_mut() {
        match canary_percent(update.rollout.as_ref()) {
            Some(pct) => {
                obj.insert("canaryTrafficPercent".to_string(), json!(pct));
            }
            None if update.rollout.is_some() => {
                obj.remove("canaryTrafficPercent");
            }
            None => {}
        }
    }
    Ok(())
}

/// Status of an InferenceService. KServe does not report a replica count, so
/// a Ready service counts as running `minReplicas`.
pub fn status_of(obj: &DynamicObject) -> FrameworkStatus {
    let raw_status = obj.data.get("status").cloned().unwrap_or(Value::Null);
    let conditions = conditions_from(&raw_status);
    let min = obj
        .data
        .pointer("/spec/predictor/minReplicas")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;
    let ready = condition_true(&conditions, "Ready");
    FrameworkStatus {
        replica_count: min,
        ready_replicas: if ready { min.max(1) } else { 0 },
        conditions,
        raw_status,
    }
}

#[async_trait]
impl FrameworkAdapter for KServeAdapter {
    fn framework(&self) -> &str {
        FRAMEWORK
    }

    async fn create(&self, req: &WorkloadRequest) -> Result<ResourceRef, AdapterError> {
        let target = req.resource_ref();
        let obj = build_inference_service(req, self.settings.container_port);
        self.api(&target.namespace)
            .patch(&target.name, &apply_params(), &Patch::Apply(&obj))
            .await
            .map_err(|e| classify(e, &format!("InferenceService {target}")))?;
        info!(resource = %target, image = %req.image, "applied InferenceService");
        Ok(target)
    }

    async fn update(
        &self,
        target: &ResourceRef,
        update: &WorkloadUpdate,
    ) -> Result<(), AdapterError> {
        let api = self.api(&target.namespace);
        let what = format!("InferenceService {target}");
        let mut obj = api
            .get(&target.name)
            .await
            .map_err(|e| classify(e, &what))?;
        apply_update(&mut obj.data, update)?;
        // resourceVersion from the read makes this a compare-and-swap; a
        // concurrent writer yields 409, which is retried as transient.
        api.replace(&target.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| classify(e, &what))?;
        debug!(resource = %target, "replaced InferenceService");
        Ok(())
    }

    async fn fetch_status(&self, target: &ResourceRef) -> Result<FrameworkStatus, AdapterError> {
        let obj = self
            .api(&target.namespace)
            .get(&target.name)
            .await
            .map_err(|e| classify(e, &format!("InferenceService {target}")))?;
        Ok(status_of(&obj))
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError> {
        let confirm = DeleteConfirm::new(
            self.settings.delete_poll_interval(),
            self.settings.delete_confirm_timeout(),
        );
        let existed = delete_confirmed(
            &self.api(&target.namespace),
            &target.name,
            "InferenceService",
            confirm,
        )
        .await?;
        if !existed {
            return Err(AdapterError::NotFound(target.to_string()));
        }
        info!(resource = %target, "InferenceService deleted");
        Ok(())
    }
}
