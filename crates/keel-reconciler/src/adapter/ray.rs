//! Ray Serve backend: one `RayService` per endpoint.

use std::sync::OnceLock;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use keel_common::config::ClusterSettings;
use keel_common::ResourceRef;

use super::cluster::{
    api_resource, apply_params, classify, condition_true, conditions_from, delete_confirmed,
    labels, resources_json, DeleteConfirm,
};
use super::{
    AdapterError, FrameworkAdapter, FrameworkStatus, ScalingSpec, WorkloadRequest, WorkloadUpdate,
};

pub const FRAMEWORK: &str = "ray";
const ROUTE_ANNOTATION: &str = "keel.io/route";
const MODEL_REF_ANNOTATION: &str = "keel.io/model-ref";
const WORKER_GROUP: &str = "serve-workers";
const SERVE_PORT: u16 = 8000;

fn rayservice_resource() -> &'static ApiResource {
    static AR: OnceLock<ApiResource> = OnceLock::new();
    AR.get_or_init(|| api_resource("ray.io", "v1", "RayService", "rayservices"))
}

pub struct RayServeAdapter {
    client: Client,
    settings: ClusterSettings,
}

impl RayServeAdapter {
    pub fn new(client: Client, settings: ClusterSettings) -> Self {
        Self { client, settings }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, rayservice_resource())
    }
}

/// Parameters that end up in `serveConfigV2`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServeApp<'a> {
    pub name: &'a str,
    pub route: &'a str,
    pub import_path: &'a str,
    pub model_ref: Option<&'a str>,
    pub gpus: u32,
    pub scaling: &'a ScalingSpec,
}

/// Render the Ray Serve application config. KubeRay expects it as a YAML string.
pub fn serve_config(app: &ServeApp<'_>) -> String {
    let mut cfg = format!(
        "applications:\n\
         \x20 - name: {name}\n\
         \x20   route_prefix: {route}\n\
         \x20   import_path: {import}\n",
        name = app.name,
        route = app.route,
        import = app.import_path,
    );
    if let Some(model_ref) = app.model_ref {
        cfg.push_str(&format!(
            "    runtime_env:\n      env_vars:\n        MODEL_REF: {model_ref:?}\n"
        ));
    }
    cfg.push_str(&format!(
        "    deployments:\n\
         \x20     - name: {name}\n\
         \x20       autoscaling_config:\n\
         \x20         min_replicas: {min}\n\
         \x20         max_replicas: {max}\n",
        name = app.name,
        min = app.scaling.min_replicas,
        max = app.scaling.max_replicas,
    ));
    if let Some(latency) = app.scaling.autoscale.as_ref().and_then(|p| p.target_latency_ms) {
        cfg.push_str(&format!(
            "          upscale_delay_s: {}\n",
            (latency / 1000).max(1)
        ));
    }
    cfg.push_str(&format!(
        "        ray_actor_options:\n          num_gpus: {}\n",
        app.gpus
    ));
    cfg
}

fn worker_group(image: &str, req_resources: Value, scaling: &ScalingSpec) -> Value {
    json!({
        "groupName": WORKER_GROUP,
        "replicas": scaling.min_replicas,
        "minReplicas": scaling.min_replicas,
        "maxReplicas": scaling.max_replicas,
        "rayStartParams": {},
        "template": {"spec": {"containers": [{
            "name": "ray-worker",
            "image": image,
            "resources": req_resources,
        }]}},
    })
}

pub fn build_ray_service(req: &WorkloadRequest, settings: &ClusterSettings) -> DynamicObject {
    let target = req.resource_ref();
    let config = serve_config(&ServeApp {
        name: &target.name,
        route: &req.route,
        import_path: &settings.ray_import_path,
        model_ref: req.model_ref.as_deref(),
        gpus: req.resources.gpus,
        scaling: &req.scaling,
    });

    let head = json!({
        "rayStartParams": {"dashboard-host": "0.0.0.0"},
        "template": {"spec": {"containers": [{
            "name": "ray-head",
            "image": req.image,
            "ports": [
                {"containerPort": 6379, "name": "gcs-server"},
                {"containerPort": 8265, "name": "dashboard"},
                {"containerPort": SERVE_PORT, "name": "serve"},
            ],
        }]}},
    });

    let mut obj = DynamicObject::new(&target.name, rayservice_resource())
        .within(&target.namespace)
        .data(json!({
            "spec": {
                "serveConfigV2": config,
                "rayClusterConfig": {
                    "rayVersion": settings.ray_version,
                    "enableInTreeAutoscaling": true,
                    "headGroupSpec": head,
                    "workerGroupSpecs": [
                        worker_group(&req.image, resources_json(&req.resources), &req.scaling)
                    ],
                },
            }
        }));
    obj.metadata.labels = Some(labels(&target.name));
    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(ROUTE_ANNOTATION.to_string(), req.route.clone());
    if let Some(model_ref) = &req.model_ref {
        annotations.insert(MODEL_REF_ANNOTATION.to_string(), model_ref.clone());
    }
    obj.metadata.annotations = Some(annotations);
    obj
}

fn gpus_of(resources: &Value) -> u32 {
    resources
        .pointer("/limits/nvidia.com~1gpu")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Apply a partial update to a fetched RayService body.
pub fn apply_update(
    obj: &mut DynamicObject,
    update: &WorkloadUpdate,
    settings: &ClusterSettings,
) -> Result<(), AdapterError> {
    let annotation = |key: &str| {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .cloned()
    };
    let route = annotation(ROUTE_ANNOTATION)
        .ok_or_else(|| AdapterError::Permanent("RayService has no route annotation".into()))?;
    let model_ref = annotation(MODEL_REF_ANNOTATION);
    let name = obj.metadata.name.clone().unwrap_or_default();

    let cluster = obj
        .data
        .pointer_mut("/spec/rayClusterConfig")
        .ok_or_else(|| AdapterError::Permanent("RayService has no rayClusterConfig".into()))?;

    if let Some(image) = &update.image {
        if let Some(head) = cluster.pointer_mut("/headGroupSpec/template/spec/containers/0") {
            head["image"] = json!(image);
        }
    }

    let worker = cluster
        .pointer_mut("/workerGroupSpecs/0")
        .ok_or_else(|| AdapterError::Permanent("RayService has no worker group".into()))?;
    let container = worker
        .pointer_mut("/template/spec/containers/0")
        .ok_or_else(|| AdapterError::Permanent("worker group has no container".into()))?;
    if let Some(image) = &update.image {
        container["image"] = json!(image);
    }
    if let Some(res) = &update.resources {
        container["resources"] = resources_json(res);
    }
    let gpus = gpus_of(&container["resources"]);
    if let Some(scaling) = &update.scaling {
        worker["replicas"] = json!(scaling.min_replicas);
        worker["minReplicas"] = json!(scaling.min_replicas);
        worker["maxReplicas"] = json!(scaling.max_replicas);
    }

    if update.scaling.is_some() || update.resources.is_some() {
        let min = worker["minReplicas"].as_u64().unwrap_or(1) as u32;
        let max = worker["maxReplicas"].as_u64().unwrap_or(u64::from(min)) as u32;
        let current = ScalingSpec {
            min_replicas: min,
            max_replicas: max,
            autoscale: None,
        };
        let scaling = update.scaling.as_ref().unwrap_or(&current);
        let config = serve_config(&ServeApp {
            name: &name,
            route: &route,
            import_path: &settings.ray_import_path,
            model_ref: model_ref.as_deref(),
            gpus,
            scaling,
        });
        obj.data["spec"]["serveConfigV2"] = json!(config);
    }
    Ok(())
}

pub fn status_of(obj: &DynamicObject) -> FrameworkStatus {
    let raw_status = obj.data.get("status").cloned().unwrap_or(Value::Null);
    let conditions = conditions_from(&raw_status);
    let running = raw_status.get("serviceStatus").and_then(Value::as_str) == Some("Running")
        || condition_true(&conditions, "Ready");
    let cluster_status = raw_status.pointer("/activeServiceStatus/rayClusterStatus");
    let count = |key: &str| {
        cluster_status
            .and_then(|s| s.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };
    let available = count("availableWorkerReplicas");
    let desired = count("desiredWorkerReplicas").max(available);
    FrameworkStatus {
        replica_count: desired,
        ready_replicas: if running { available } else { 0 },
        conditions,
        raw_status,
    }
}

#[async_trait]
impl FrameworkAdapter for RayServeAdapter {
    fn framework(&self) -> &str {
        FRAMEWORK
    }

    async fn create(&self, req: &WorkloadRequest) -> Result<ResourceRef, AdapterError> {
        let target = req.resource_ref();
        let obj = build_ray_service(req, &self.settings);
        self.api(&target.namespace)
            .patch(&target.name, &apply_params(), &Patch::Apply(&obj))
            .await
            .map_err(|e| classify(e, &format!("RayService {target}")))?;
        info!(resource = %target, image = %req.image, "applied RayService");
        Ok(target)
    }

    async fn update(
        &self,
        target: &ResourceRef,
        update: &WorkloadUpdate,
    ) -> Result<(), AdapterError> {
        let api = self.api(&target.namespace);
        let what = format!("RayService {target}");
        let mut obj = api
            .get(&target.name)
            .await
            .map_err(|e| classify(e, &what))?;
        apply_update(&mut obj, update, &self.settings)?;
        api.replace(&target.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| classify(e, &what))?;
        debug!(resource = %target, "replaced RayService");
        Ok(())
    }

    async fn fetch_status(&self, target: &ResourceRef) -> Result<FrameworkStatus, AdapterError> {
        let obj = self
            .api(&target.namespace)
            .get(&target.name)
            .await
            .map_err(|e| classify(e, &format!("RayService {target}")))?;
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
            "RayService",
            confirm,
        )
        .await?;
        if !existed {
            return Err(AdapterError::NotFound(target.to_string()));
        }
        info!(resource = %target, "RayService deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_common::ResourceQuantities;

    use super::*;
    use crate::adapter::WorkloadResources;

    fn request() -> WorkloadRequest {
        WorkloadRequest {
            endpoint_id: "rag-bot".to_string(),
            namespace: "serving-stg".to_string(),
            image: "registry.internal/serving/rag-runtime:0.9.0-cuda".to_string(),
            resources: WorkloadResources {
                quantities: ResourceQuantities {
                    memory_limit: Some("32Gi".into()),
                    ..Default::default()
                },
                gpus: 1,
            },
            scaling: ScalingSpec {
                min_replicas: 1,
                max_replicas: 3,
                autoscale: None,
            },
            route: "/v1/rag/bot".to_string(),
            rollout: None,
            model_ref: Some("models/rag/v1".to_string()),
        }
    }

    #[test]
    fn serve_config_carries_route_and_scaling() {
        let req = request();
        let cfg = serve_config(&ServeApp {
            name: "keel-rag-bot",
            route: &req.route,
            import_path: "serving.app:deployment",
            model_ref: req.model_ref.as_deref(),
            gpus: 1,
            scaling: &req.scaling,
        });
        assert!(cfg.starts_with("applications:\n  - name: keel-rag-bot\n"));
        assert!(cfg.contains("    route_prefix: /v1/rag/bot\n"));
        assert!(cfg.contains("        MODEL_REF: \"models/rag/v1\"\n"));
        assert!(cfg.contains("          max_replicas: 3\n"));
        assert!(cfg.contains("          num_gpus: 1\n"));
    }

    #[test]
    fn ray_service_shape() {
        let obj = build_ray_service(&request(), &ClusterSettings::default());
        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value["apiVersion"], "ray.io/v1");
        assert_eq!(value["kind"], "RayService");
        let cluster = &value["spec"]["rayClusterConfig"];
        assert_eq!(cluster["rayVersion"], "2.9.0");
        assert_eq!(cluster["workerGroupSpecs"][0]["maxReplicas"], 3);
        assert_eq!(
            cluster["headGroupSpec"]["template"]["spec"]["containers"][0]["image"],
            "registry.internal/serving/rag-runtime:0.9.0-cuda"
        );
    }

    #[test]
    fn scaling_update_rewrites_serve_config() {
        let settings = ClusterSettings::default();
        let mut obj = build_ray_service(&request(), &settings);
        apply_update(
            &mut obj,
            &WorkloadUpdate {
                scaling: Some(ScalingSpec {
                    min_replicas: 2,
                    max_replicas: 5,
                    autoscale: None,
                }),
                ..Default::default()
            },
            &settings,
        )
        .unwrap();
        let cfg = obj.data["spec"]["serveConfigV2"].as_str().unwrap();
        assert!(cfg.contains("          max_replicas: 5\n"));
        assert!(cfg.contains("    route_prefix: /v1/rag/bot\n"));
        assert!(cfg.contains("          num_gpus: 1\n"));
        assert_eq!(obj.data["spec"]["rayClusterConfig"]["workerGroupSpecs"][0]["replicas"], 2);
    }

    #[test]
    fn running_service_reports_available_workers() {
        let mut obj = build_ray_service(&request(), &ClusterSettings::default());
        obj.data["status"] = json!({
            "serviceStatus": "Running",
            "activeServiceStatus": {"rayClusterStatus": {
                "availableWorkerReplicas": 2,
                "desiredWorkerReplicas": 3
            }}
        });
        let status = status_of(&obj);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.replica_count, 3);
    }
}
