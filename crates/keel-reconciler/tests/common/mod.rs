#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use keel_common::config::FrameworkDefaults;
use keel_common::{
    DeployRequest, DeploymentSpec, Environment, PlatformConfig, ResourceQuantities, ResourceRef,
    RuntimeLimits, SpecResources,
};
use keel_meta::{EndpointStore, KvEndpointStore, MemoryMetaStore};
use keel_reconciler::adapter::{
    AdapterError, AdapterRegistry, FrameworkAdapter, FrameworkStatus, WorkloadRequest,
    WorkloadUpdate,
};
use keel_reconciler::metrics::SharedMetrics;
use keel_reconciler::ReconciliationEngine;

pub const FAKE: &str = "fake";

#[derive(Debug, Clone, PartialEq)]
pub struct FakeWorkload {
    pub image: String,
    pub gpus: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
}

/// In-process framework adapter with call counters and failure injection.
#[derive(Default)]
pub struct FakeAdapter {
    pub creates: AtomicU32,
    pub updates: AtomicU32,
    pub deletes: AtomicU32,
    pub fetches: AtomicU32,
    ready: AtomicBool,
    delay: Mutex<Duration>,
    create_failures: Mutex<VecDeque<AdapterError>>,
    update_failures: Mutex<VecDeque<AdapterError>>,
    delete_failures: Mutex<VecDeque<AdapterError>>,
    fetch_failures: Mutex<VecDeque<AdapterError>>,
    workloads: Mutex<HashMap<ResourceRef, FakeWorkload>>,
    events: Mutex<Vec<String>>,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        let a = Self::default();
        a.ready.store(true, Ordering::SeqCst);
        Arc::new(a)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock().unwrap() = d;
    }

    pub fn fail_create(&self, err: AdapterError, times: usize) {
        self.create_failures.lock().unwrap().extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_update(&self, err: AdapterError, times: usize) {
        self.update_failures.lock().unwrap().extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_delete(&self, err: AdapterError, times: usize) {
        self.delete_failures.lock().unwrap().extend(std::iter::repeat(err).take(times));
    }

    pub fn fail_fetch(&self, err: AdapterError, times: usize) {
        self.fetch_failures.lock().unwrap().extend(std::iter::repeat(err).take(times));
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<FakeWorkload> {
        self.workloads
            .lock()
            .unwrap()
            .get(&ResourceRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .cloned()
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.lock().unwrap().len()
    }

    /// Drop a workload behind the reconciler's back.
    pub fn forget_all(&self) {
        self.workloads.lock().unwrap().clear();
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn event(&self, e: String) {
        self.events.lock().unwrap().push(e);
    }

    async fn pause(&self) {
        let d = *self.delay.lock().unwrap();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }
}

fn next_failure(q: &Mutex<VecDeque<AdapterError>>) -> Option<AdapterError> {
    q.lock().unwrap().pop_front()
}

#[async_trait]
impl FrameworkAdapter for FakeAdapter {
    fn framework(&self) -> &str {
        FAKE
    }

    async fn create(&self, req: &WorkloadRequest) -> Result<ResourceRef, AdapterError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.event(format!("create:start:{}", req.endpoint_id));
        self.pause().await;
        let out = match next_failure(&self.create_failures) {
            Some(e) => Err(e),
            None => {
                let target = req.resource_ref();
                self.workloads.lock().unwrap().insert(
                    target.clone(),
                    FakeWorkload {
                        image: req.image.clone(),
                        gpus: req.resources.gpus,
                        min_replicas: req.scaling.min_replicas,
                        max_replicas: req.scaling.max_replicas,
                    },
                );
                Ok(target)
            }
        };
        self.event(format!("create:end:{}", req.endpoint_id));
        out
    }

    async fn update(&self, target: &ResourceRef, update: &WorkloadUpdate) -> Result<(), AdapterError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.event(format!("update:start:{}", target.name));
        self.pause().await;
        let out = match next_failure(&self.update_failures) {
            Some(e) => Err(e),
            None => {
                let mut workloads = self.workloads.lock().unwrap();
                match workloads.get_mut(target) {
                    None => Err(AdapterError::NotFound(target.to_string())),
                    Some(w) => {
                        if let Some(image) = &update.image {
                            w.image = image.clone();
                        }
                        if let Some(res) = &update.resources {
                            w.gpus = res.gpus;
                        }
                        if let Some(s) = &update.scaling {
                            w.min_replicas = s.min_replicas;
                            w.max_replicas = s.max_replicas;
                        }
                        Ok(())
                    }
                }
            }
        };
        self.event(format!("update:end:{}", target.name));
        out
    }

    async fn fetch_status(&self, target: &ResourceRef) -> Result<FrameworkStatus, AdapterError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = next_failure(&self.fetch_failures) {
            return Err(e);
        }
        let Some(w) = self.workloads.lock().unwrap().get(target).cloned() else {
            return Err(AdapterError::NotFound(target.to_string()));
        };
        let ready = if self.ready.load(Ordering::SeqCst) {
            w.min_replicas
        } else {
            0
        };
        Ok(FrameworkStatus {
            replica_count: w.min_replicas,
            ready_replicas: ready,
            conditions: Vec::new(),
            raw_status: serde_json::json!({ "image": w.image, "ready": ready }),
        })
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), AdapterError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.event(format!("delete:start:{}", target.name));
        self.pause().await;
        let out = match next_failure(&self.delete_failures) {
            Some(e) => Err(e),
            None => match self.workloads.lock().unwrap().remove(target) {
                Some(_) => Ok(()),
                None => Err(AdapterError::NotFound(target.to_string())),
            },
        };
        self.event(format!("delete:end:{}", target.name));
        out
    }
}

pub fn test_config() -> PlatformConfig {
    let mut cfg = PlatformConfig::default();
    cfg.frameworks = FrameworkDefaults {
        per_environment: Default::default(),
        fallback: FAKE.to_string(),
    };
    cfg.lifecycle.max_attempts = 3;
    cfg.lifecycle.initial_backoff_ms = 1;
    cfg.lifecycle.max_backoff_ms = 2;
    cfg.lifecycle.call_timeout_ms = 2_000;
    cfg.lifecycle.delete_timeout_ms = 2_000;
    cfg.lifecycle.settle_probes = 1;
    cfg.lifecycle.settle_interval_ms = 0;
    cfg.health.healthy_threshold = 2;
    cfg.health.unhealthy_threshold = 2;
    cfg
}

pub struct Harness {
    pub engine: ReconciliationEngine,
    pub adapter: Arc<FakeAdapter>,
    pub store: Arc<dyn EndpointStore>,
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(cfg: PlatformConfig) -> Harness {
    let adapter = FakeAdapter::new();
    let store: Arc<dyn EndpointStore> = Arc::new(KvEndpointStore::new(MemoryMetaStore::new()));
    let registry = AdapterRegistry::new().with(adapter.clone());
    let engine = ReconciliationEngine::new(
        store.clone(),
        registry,
        Arc::new(cfg),
        Arc::new(SharedMetrics::default()),
    );
    Harness {
        engine,
        adapter,
        store,
    }
}

pub fn gpu_spec() -> DeploymentSpec {
    DeploymentSpec {
        model_ref: "models/llama-3-8b/v2".to_string(),
        model_family: "llama".to_string(),
        job_type: "SFT".to_string(),
        serve_target: "GENERATION".to_string(),
        resources: SpecResources {
            gpus: 1,
            gpu_memory_gb: Some(24.0),
        },
        runtime: RuntimeLimits {
            max_concurrent_requests: Some(16),
            max_input_tokens: Some(4096),
            max_output_tokens: Some(1024),
        },
        use_gpu: true,
        rollout: None,
    }
}

pub fn deploy_request(id: &str, route: &str) -> DeployRequest {
    DeployRequest {
        id: Some(id.to_string()),
        model_entry_id: "llama-3-8b".to_string(),
        environment: Environment::Dev,
        route: route.to_string(),
        min_replicas: 1,
        max_replicas: 2,
        runtime_image: None,
        use_gpu: None,
        resources: ResourceQuantities::default(),
        autoscale_policy: None,
        deployment_spec: Some(gpu_spec()),
        serving_framework: None,
        model_metadata: None,
    }
}

pub const NAMESPACE: &str = "serving-dev";
