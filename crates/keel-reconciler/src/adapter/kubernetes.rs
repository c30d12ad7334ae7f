//! Plain Kubernetes backend: Deployment + Service + Ingress + HPA.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec as K8sDeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricIdentifier, MetricSpec, MetricTarget, PodsMetricSource, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use keel_common::config::ClusterSettings;
use keel_common::{AutoscalePolicy, ResourceRef};

use super::cluster::{
    apply_params, classify, delete_confirmed, labels, resource_requirements, DeleteConfirm,
    GPU_RESOURCE,
};
use super::{
    AdapterError, FrameworkAdapter, FrameworkStatus, ScalingSpec, StatusCondition,
    WorkloadRequest, WorkloadResources, WorkloadUpdate,
};

pub const FRAMEWORK: &str = "kubernetes";
const CONTAINER_NAME: &str = "server";
const SERVICE_PORT: i32 = 80;
const DEFAULT_CPU_UTILIZATION: i32 = 80;
const GPU_UTIL_METRIC: &str = "DCGM_FI_DEV_GPU_UTIL";
const LATENCY_METRIC: &str = "inference_request_latency_ms";

pub struct KubernetesAdapter {
    client: Client,
    settings: ClusterSettings,
}

impl KubernetesAdapter {
    pub fn new(client: Client, settings: ClusterSettings) -> Self {
        Self { client, settings }
    }

    fn confirm(&self) -> DeleteConfirm {
        DeleteConfirm::new(
            self.settings.delete_poll_interval(),
            self.settings.delete_confirm_timeout(),
        )
    }
}

fn meta(target: &ResourceRef) -> ObjectMeta {
    ObjectMeta {
        name: Some(target.name.clone()),
        namespace: Some(target.namespace.clone()),
        labels: Some(labels(&target.name)),
        ..Default::default()
    }
}

pub fn build_deployment(req: &WorkloadRequest, container_port: u16) -> Deployment {
    let target = req.resource_ref();
    let selector = labels(&target.name);

    let mut env = vec![EnvVar {
        name: "KEEL_ENDPOINT_ID".to_string(),
        value: Some(req.endpoint_id.clone()),
        ..Default::default()
    }];
    if let Some(model_ref) = &req.model_ref {
        env.push(EnvVar {
            name: "MODEL_REF".to_string(),
            value: Some(model_ref.clone()),
            ..Default::default()
        });
    }

    Deployment {
        metadata: meta(&target),
        spec: Some(K8sDeploymentSpec {
            replicas: Some(req.scaling.min_replicas as i32),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(req.image.clone()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: i32::from(container_port),
                            ..Default::default()
                        }]),
                        env: Some(env),
                        resources: Some(resource_requirements(&req.resources)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_service(target: &ResourceRef, container_port: u16) -> Service {
    Service {
        metadata: meta(target),
        spec: Some(ServiceSpec {
            selector: Some(labels(&target.name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(i32::from(container_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn build_ingress(target: &ResourceRef, route: &str, class: Option<&str>) -> Ingress {
    Ingress {
        metadata: meta(target),
        spec: Some(IngressSpec {
            ingress_class_name: class.map(String::from),
            rules: Some(vec![IngressRule {
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(route.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: target.name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVICE_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn hpa_metrics(policy: Option<&AutoscalePolicy>) -> Vec<MetricSpec> {
    let cpu = policy
        .and_then(|p| p.cpu_utilization)
        .map(|v| v as i32)
        .unwrap_or(DEFAULT_CPU_UTILIZATION);
    let mut metrics = vec![MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: "cpu".to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(cpu),
                ..Default::default()
            },
        }),
        ..Default::default()
    }];

    let pods_metric = |name: &str, value: u32| MetricSpec {
        type_: "Pods".to_string(),
        pods: Some(PodsMetricSource {
            metric: MetricIdentifier {
                name: name.to_string(),
                selector: None,
            },
            target: MetricTarget {
                type_: "AverageValue".to_string(),
                average_value: Some(Quantity(value.to_string())),
                ..Default::default()
            },
        }),
        ..Default::default()
    };
    if let Some(gpu) = policy.and_then(|p| p.gpu_utilization) {
        metrics.push(pods_metric(GPU_UTIL_METRIC, gpu));
    }
    if let Some(latency) = policy.and_then(|p| p.target_latency_ms) {
        metrics.push(pods_metric(LATENCY_METRIC, latency));
    }
    metrics
}

pub fn build_hpa(target: &ResourceRef, scaling: &ScalingSpec) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: meta(target),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: target.name.clone(),
            },
            min_replicas: Some(scaling.min_replicas as i32),
            max_replicas: scaling.max_replicas as i32,
            metrics: Some(hpa_metrics(scaling.autoscale.as_ref())),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Strategic-merge resources with explicit nulls, so dropping a quantity
/// (e.g. GPU -> CPU) removes it instead of leaving the old value behind.
fn resources_patch(res: &WorkloadResources) -> Value {
    let q = &res.quantities;
    let gpus = (res.gpus > 0).then(|| res.gpus.to_string());
    json!({
        "requests": {
            "cpu": q.cpu_request,
            "memory": q.memory_request,
            GPU_RESOURCE: gpus,
        },
        "limits": {
            "cpu": q.cpu_limit,
            "memory": q.memory_limit,
            GPU_RESOURCE: gpus,
        },
    })
}

pub fn container_patch(update: &WorkloadUpdate) -> Option<Value> {
    if update.image.is_none() && update.resources.is_none() {
        return None;
    }
    let mut container = json!({ "name": CONTAINER_NAME });
    if let Some(image) = &update.image {
        container["image"] = json!(image);
    }
    if let Some(res) = &update.resources {
        container["resources"] = resources_patch(res);
    }
    Some(json!({
        "spec": { "template": { "spec": { "containers": [container] } } }
    }))
}

#[async_trait]
impl FrameworkAdapter for KubernetesAdapter {
    fn framework(&self) -> &str {
        FRAMEWORK
    }

    async fn create(&self, req: &WorkloadRequest) -> Result<ResourceRef, AdapterError> {
        let target = req.resource_ref();
        let ns = target.namespace.as_str();
        let name = target.name.as_str();
        let pp = apply_params();
        let port = self.settings.container_port;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        deployments
            .patch(name, &pp, &Patch::Apply(&build_deployment(req, port)))
            .await
            .map_err(|e| classify(e, &format!("Deployment {target}")))?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), ns);
        services
            .patch(name, &pp, &Patch::Apply(&build_service(&target, port)))
            .await
            .map_err(|e| classify(e, &format!("Service {target}")))?;

        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), ns);
        let ingress = build_ingress(&target, &req.route, self.settings.ingress_class.as_deref());
        ingresses
            .patch(name, &pp, &Patch::Apply(&ingress))
            .await
            .map_err(|e| classify(e, &format!("Ingress {target}")))?;

        let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), ns);
        hpas.patch(name, &pp, &Patch::Apply(&build_hpa(&target, &req.scaling)))
            .await
            .map_err(|e| classify(e, &format!("HorizontalPodAutoscaler {target}")))?;

        info!(resource = %target, image = %req.image, "applied kubernetes workload");
        Ok(target)
    }

    async fn update(
        &self,
        target: &ResourceRef,
        update: &WorkloadUpdate,
    ) -> Result<(), AdapterError> {
        let ns = target.namespace.as_str();
        let name = target.name.as_str();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), ns);

        // Existence check up front so a missing Deployment is never half-updated.
        match deployments.get_opt(name).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(AdapterError::NotFound(format!("Deployment {target}"))),
            Err(e) => return Err(classify(e, &format!("Deployment {target}"))),
        }

        if let Some(patch) = container_patch(update) {
            deployments
                .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
                .await
                .map_err(|e| classify(e, &format!("Deployment {target}")))?;
        }

        if let Some(scaling) = &update.scaling {
            let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), ns);
            let patch = json!({
                "spec": {
                    "minReplicas": scaling.min_replicas,
                    "maxReplicas": scaling.max_replicas,
                    "metrics": hpa_metrics(scaling.autoscale.as_ref()),
                }
            });
            hpas.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| classify(e, &format!("HorizontalPodAutoscaler {target}")))?;
        }

        debug!(resource = %target, "patched kubernetes workload");
        Ok(())
    }

    async fn fetch_status(&self, target: &ResourceRef) -> Result<FrameworkStatus, AdapterError> {
        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), target.namespace.as_str());
        let dep = deployments
            .get(&target.name)
            .await
            .map_err(|e| classify(e, &format!("Deployment {target}")))?;

        let status = dep.status.unwrap_or_default();
        let conditions = status
            .conditions
            .iter()
            .flatten()
            .map(|c| StatusCondition {
                type_: c.type_.clone(),
                status: c.status.clone(),
                reason: c.reason.clone(),
                message: c.message.clone(),
            })
            .collect();
        let raw_status = serde_json::to_value(&status).unwrap_or(Value::Null);

        Ok(FrameworkStatus {
            replica_count: status.replicas.unwrap_or(0).max(0) as u32,
            ready_replicas: status.ready_replicas.unwrap_or(0).max(0) as u32,
            conditions,
            raw_status,
        })
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError> {
        let ns = target.namespace.as_str();
        let name = target.name.as_str();
        // One confirmation budget covers all four objects.
        let confirm = self.confirm();

        // Front door first, workload last.
        let mut existed = false;
        existed |= delete_confirmed(
            &Api::<Ingress>::namespaced(self.client.clone(), ns),
            name,
            "Ingress",
            confirm,
        )
        .await?;
        existed |= delete_confirmed(
            &Api::<HorizontalPodAutoscaler>::namespaced(self.client.clone(), ns),
            name,
            "HorizontalPodAutoscaler",
            confirm,
        )
        .await?;
        existed |= delete_confirmed(
            &Api::<Service>::namespaced(self.client.clone(), ns),
            name,
            "Service",
            confirm,
        )
        .await?;
        existed |= delete_confirmed(
            &Api::<Deployment>::namespaced(self.client.clone(), ns),
            name,
            "Deployment",
            confirm,
        )
        .await?;

        if !existed {
            return Err(AdapterError::NotFound(target.to_string()));
        }
        info!(resource = %target, "kubernetes workload deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_common::ResourceQuantities;

    use super::*;
    use crate::adapter::resource_name;

    fn request() -> WorkloadRequest {
        WorkloadRequest {
            endpoint_id: "support-bot".to_string(),
            namespace: "serving-dev".to_string(),
            image: "vllm/vllm-openai:v0.6.3".to_string(),
            resources: WorkloadResources {
                quantities: ResourceQuantities {
                    cpu_request: Some("4".into()),
                    memory_limit: Some("32Gi".into()),
                    ..Default::default()
                },
                gpus: 1,
            },
            scaling: ScalingSpec {
                min_replicas: 2,
                max_replicas: 4,
                autoscale: Some(AutoscalePolicy {
                    gpu_utilization: Some(70),
                    target_latency_ms: Some(500),
                    cpu_utilization: None,
                }),
            },
            route: "/v1/models/support-bot".to_string(),
            rollout: None,
            model_ref: Some("models/llama/v2".to_string()),
        }
    }

    #[test]
    fn deployment_carries_image_replicas_and_labels() {
        let dep = build_deployment(&request(), 8080);
        assert_eq!(dep.metadata.name, Some(resource_name("support-bot")));
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.name, "server");
        assert_eq!(container.image.as_deref(), Some("vllm/vllm-openai:v0.6.3"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);

        let value = serde_json::to_value(build_deployment(&request(), 8080)).unwrap();
        assert_eq!(value["apiVersion"], "apps/v1");
        assert_eq!(value["kind"], "Deployment");
    }

    #[test]
    fn ingress_routes_the_endpoint_path_to_the_service() {
        let target = request().resource_ref();
        let ing = build_ingress(&target, "/v1/models/support-bot", Some("nginx"));
        let spec = ing.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let rules = spec.rules.unwrap();
        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/v1/models/support-bot"));
        assert_eq!(path.path_type, "Prefix");
        assert_eq!(
            path.backend.service.as_ref().map(|s| s.name.clone()),
            Some(resource_name("support-bot"))
        );
    }

    #[test]
    fn hpa_has_cpu_and_pods_metrics() {
        let req = request();
        let hpa = build_hpa(&req.resource_ref(), &req.scaling);
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 4);
        let metrics = spec.metrics.unwrap();
        assert_eq!(metrics.len(), 3);
        assert_eq!(
            metrics[0].resource.as_ref().unwrap().target.average_utilization,
            Some(80)
        );
        assert_eq!(
            metrics[1].pods.as_ref().unwrap().metric.name,
            GPU_UTIL_METRIC
        );
    }

    #[test]
    fn switching_to_cpu_nulls_out_gpu_quantities() {
        let update = WorkloadUpdate {
            resources: Some(WorkloadResources {
                quantities: ResourceQuantities {
                    cpu_limit: Some("2".into()),
                    ..Default::default()
                },
                gpus: 0,
            }),
            ..Default::default()
        };
        let patch = container_patch(&update).unwrap();
        let container = &patch["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["name"], "server");
        assert!(container["resources"]["limits"][GPU_RESOURCE].is_null());
        assert_eq!(container["resources"]["limits"]["cpu"], "2");
        assert!(container.get("image").is_none());

        assert!(container_patch(&WorkloadUpdate::default()).is_none());
    }
}
