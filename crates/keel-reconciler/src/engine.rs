use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use keel_common::{
    DeployRequest, DeploymentSpec, EndpointFilter, EndpointStatus, Override, PlatformConfig,
    RedeployOverrides, ResourceQuantities, ResourceRef, RollbackPlan, ServingDeployment,
    ServingEndpoint,
};
use keel_meta::{DeploymentWrite, EndpointStore, StoreError};

use crate::adapter::{
    resource_name, AdapterError, AdapterRegistry, FrameworkAdapter, FrameworkStatus, ScalingSpec,
    WorkloadRequest, WorkloadResources, WorkloadUpdate,
};
use crate::error::ReconcileError;
use crate::image_policy::{ImagePolicyResolver, ImageQuery};
use crate::locks::EndpointLocks;
use crate::metrics::{Op, SharedMetrics};
use crate::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::validator::{validate, validate_replicas, validate_route};

/// Result of a successful lifecycle call.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleOutcome {
    pub endpoint: ServingEndpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<ServingDeployment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointView {
    pub endpoint: ServingEndpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<ServingDeployment>,
}

/// Drives endpoints through deploy, redeploy, rollback and delete, keeping
/// the store and the cluster in agreement.
///
/// Every lifecycle call holds the endpoint's lock for its whole duration and
/// runs on its own task, so a caller that goes away does not abort a cluster
/// mutation half way.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn EndpointStore>,
    adapters: Arc<AdapterRegistry>,
    config: Arc<PlatformConfig>,
    locks: EndpointLocks,
    retry: RetryPolicy,
    metrics: Arc<SharedMetrics>,
}

fn gpu_count(use_gpu: bool, spec: Option<&DeploymentSpec>) -> u32 {
    if !use_gpu {
        return 0;
    }
    spec.and_then(|s| u32::try_from(s.resources.gpus).ok())
        .unwrap_or(1)
        .max(1)
}

fn store_conflict(e: StoreError) -> ReconcileError {
    match e {
        StoreError::Conflict(m) => ReconcileError::Conflict(m),
        StoreError::NotFound(id) => ReconcileError::NotFound(id),
        other => ReconcileError::Store(other),
    }
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn EndpointStore>,
        adapters: AdapterRegistry,
        config: Arc<PlatformConfig>,
        metrics: Arc<SharedMetrics>,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&config.lifecycle);
        Self {
            store,
            adapters: Arc::new(adapters),
            config,
            locks: EndpointLocks::new(),
            retry,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn EndpointStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<PlatformConfig> {
        &self.config
    }

    pub fn locks(&self) -> &EndpointLocks {
        &self.locks
    }

    pub fn metrics(&self) -> &Arc<SharedMetrics> {
        &self.metrics
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn adapter(&self, framework: &str) -> Result<Arc<dyn FrameworkAdapter>, ReconcileError> {
        self.adapters
            .get(framework)
            .ok_or_else(|| ReconcileError::UnknownFramework(framework.to_string()))
    }

    fn resolver(&self) -> ImagePolicyResolver<'_> {
        ImagePolicyResolver::new(&self.config.images, &self.config.resource_profiles)
    }

    /// Run a lifecycle operation on its own task and record its outcome.
    async fn run<T, Fut>(&self, op: Op, fut: Fut) -> Result<T, ReconcileError>
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, ReconcileError>> + Send + 'static,
    {
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            let res = fut.await;
            metrics.record(op, res.is_ok());
            if let Err(e) = &res {
                warn!(op = op.as_str(), code = e.code(), error = %e, "lifecycle operation failed");
            }
            res
        });
        task.await
            .map_err(|e| ReconcileError::Internal(format!("{} task aborted: {e}", op.as_str())))?
    }

    pub async fn get(&self, id: &str) -> Result<EndpointView, ReconcileError> {
        let endpoint = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))?;
        let deployment = self.store.get_deployment(id).await?;
        Ok(EndpointView {
            endpoint,
            deployment,
        })
    }

    pub async fn list(&self, filter: &EndpointFilter) -> Result<Vec<ServingEndpoint>, ReconcileError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn deploy(&self, req: DeployRequest) -> Result<LifecycleOutcome, ReconcileError> {
        let this = self.clone();
        self.run(Op::Deploy, async move { this.deploy_locked(req).await })
            .await
    }

    pub async fn redeploy(
        &self,
        id: &str,
        overrides: RedeployOverrides,
    ) -> Result<LifecycleOutcome, ReconcileError> {
        let this = self.clone();
        let id = id.to_string();
        self.run(Op::Redeploy, async move {
            this.redeploy_locked(&id, overrides).await
        })
        .await
    }

    pub async fn rollback(&self, id: &str) -> Result<LifecycleOutcome, ReconcileError> {
        let this = self.clone();
        let id = id.to_string();
        self.run(Op::Rollback, async move { this.rollback_locked(&id).await })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ReconcileError> {
        let this = self.clone();
        let id = id.to_string();
        self.run(Op::Delete, async move { this.delete_locked(&id).await })
            .await
    }

    async fn call_with_retry<T, F, Fut>(
        &self,
        what: &str,
        limit: Duration,
        op: F,
    ) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let metrics = &self.metrics;
        retry_transient(
            &self.retry,
            limit,
            what,
            || {
                metrics.adapter_retries_total.fetch_add(1, Ordering::Relaxed);
            },
            op,
        )
        .await
    }

    /// Read status up to `settle_probes` times until the workload reports a
    /// ready replica. Read errors count as "not ready yet".
    async fn settle(
        &self,
        adapter: &dyn FrameworkAdapter,
        target: &ResourceRef,
    ) -> Option<FrameworkStatus> {
        let probes = self.config.lifecycle.settle_probes;
        let interval = Duration::from_millis(self.config.lifecycle.settle_interval_ms);
        let mut last = None;
        for attempt in 1..=probes {
            match with_timeout(self.retry.call_timeout, "fetch_status", adapter.fetch_status(target)).await {
                Ok(status) => {
                    let ready = status.is_ready();
                    last = Some(status);
                    if ready {
                        break;
                    }
                }
                Err(e) => debug!(resource = %target, attempt, error = %e, "settle probe failed"),
            }
            if attempt < probes {
                tokio::time::sleep(interval).await;
            }
        }
        last
    }

    // ---- deploy ----

    async fn deploy_locked(&self, req: DeployRequest) -> Result<LifecycleOutcome, ReconcileError> {
        let whitelist = &self.config.whitelist;
        validate_route(&req.route)?;
        validate_replicas(req.min_replicas, req.max_replicas, whitelist)?;
        if let Some(spec) = &req.deployment_spec {
            validate(spec, whitelist)?;
        }

        let framework = req
            .serving_framework
            .clone()
            .unwrap_or_else(|| self.config.framework_for(req.environment).to_string());
        let adapter = self.adapter(&framework)?;

        let spec = req.deployment_spec.as_ref();
        let use_gpu = spec
            .map(|s| s.use_gpu)
            .or(req.use_gpu)
            .unwrap_or(false);
        let resolved = self.resolver().resolve(&ImageQuery {
            explicit_image: req.runtime_image.as_deref(),
            spec,
            model_metadata: req.model_metadata.as_ref(),
            use_gpu,
            requested: Some(&req.resources),
        })?;

        let id = req
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let _guard = self.locks.acquire(&id).await;

        let desired = ServingEndpoint {
            id: id.clone(),
            model_entry_id: req.model_entry_id.clone(),
            environment: req.environment,
            route: req.route.clone(),
            status: EndpointStatus::Deploying,
            status_reason: None,
            min_replicas: req.min_replicas,
            max_replicas: req.max_replicas,
            runtime_image: Some(resolved.image.clone()),
            use_gpu,
            requested_resources: req.resources.clone(),
            resources: resolved.resources.clone(),
            autoscale_policy: req.autoscale_policy.clone(),
            deployment_spec: req.deployment_spec.clone(),
            serving_framework: framework.clone(),
            created_at: Utc::now(),
            last_health_check: None,
            rollback_plan: None,
            revision: 0,
        };

        let endpoint = match self.store.get(&id).await? {
            Some(existing) => {
                if existing.route != desired.route {
                    return Err(ReconcileError::Conflict(format!(
                        "endpoint {id} already exists with route {}",
                        existing.route
                    )));
                }
                if let Some(deployment) = self.store.get_deployment(&id).await? {
                    info!(endpoint_id = %id, status = %existing.status, "endpoint already deployed");
                    return Ok(LifecycleOutcome {
                        endpoint: existing,
                        deployment: Some(deployment),
                        warnings: vec![format!("endpoint {id} is already deployed; nothing changed")],
                    });
                }
                // No cluster resource on record: resume creation on the same row.
                info!(endpoint_id = %id, status = %existing.status, "resuming deploy");
                let resumed = ServingEndpoint {
                    created_at: existing.created_at,
                    revision: existing.revision,
                    ..desired
                };
                self.store.commit(&resumed, DeploymentWrite::Keep).await.map_err(store_conflict)?
            }
            None => self.store.insert(&desired).await.map_err(store_conflict)?,
        };

        let workload = WorkloadRequest {
            endpoint_id: id.clone(),
            namespace: self.config.cluster.namespace_for(endpoint.environment),
            image: resolved.image.clone(),
            resources: WorkloadResources {
                quantities: endpoint.resources.clone(),
                gpus: gpu_count(use_gpu, spec),
            },
            scaling: ScalingSpec {
                min_replicas: endpoint.min_replicas,
                max_replicas: endpoint.max_replicas,
                autoscale: endpoint.autoscale_policy.clone(),
            },
            route: endpoint.route.clone(),
            rollout: spec.and_then(|s| s.rollout.clone()),
            model_ref: spec.map(|s| s.model_ref.clone()).or_else(|| {
                req.model_metadata
                    .as_ref()
                    .and_then(|m| m.hf_model_id.clone())
            }),
        };

        info!(
            endpoint_id = %id,
            framework = %framework,
            image = %workload.image,
            use_gpu,
            "creating serving workload"
        );
        let created = self
            .call_with_retry("create", self.retry.call_timeout, || adapter.create(&workload))
            .await;

        let target = match created {
            Ok(target) => target,
            Err(e) => {
                return Err(self
                    .fail_deploy(endpoint, adapter.as_ref(), &workload.resource_ref(), e)
                    .await)
            }
        };

        let mut deployment = ServingDeployment {
            endpoint_id: id.clone(),
            serving_framework: framework.clone(),
            framework_resource_id: target.name.clone(),
            framework_namespace: target.namespace.clone(),
            replica_count: 0,
            min_replicas: endpoint.min_replicas,
            max_replicas: endpoint.max_replicas,
            autoscaling_metrics: endpoint.autoscale_policy.clone(),
            resource_requests: requests_of(&endpoint.resources),
            resource_limits: limits_of(&endpoint.resources),
            framework_status: serde_json::Value::Null,
            updated_at: Utc::now(),
        };

        // Record the cluster resource before waiting on it.
        let endpoint = match self
            .store
            .commit(&endpoint, DeploymentWrite::Put(deployment.clone()))
            .await
        {
            Ok(ep) => ep,
            Err(e) => {
                error!(endpoint_id = %id, resource = %target, error = %e, "could not record deployment, removing workload");
                self.cleanup(adapter.as_ref(), &target).await;
                return Err(ReconcileError::Store(e));
            }
        };

        let status = self.settle(adapter.as_ref(), &target).await;
        let mut settled = endpoint.clone();
        if let Some(s) = &status {
            deployment.replica_count = s.replica_count;
            deployment.framework_status = s.raw_status.clone();
            settled.last_health_check = Some(Utc::now());
        }
        deployment.updated_at = Utc::now();
        if status.as_ref().is_some_and(FrameworkStatus::is_ready) {
            settled.set_status(EndpointStatus::Healthy, None);
        } else {
            settled.set_status(
                EndpointStatus::Degraded,
                Some("workload created but no ready replicas yet".to_string()),
            );
        }
        let endpoint = self
            .store
            .commit(&settled, DeploymentWrite::Put(deployment.clone()))
            .await?;

        info!(endpoint_id = %id, status = %endpoint.status, "deploy complete");
        Ok(LifecycleOutcome {
            endpoint,
            deployment: Some(deployment),
            warnings: resolved.warnings,
        })
    }

    async fn fail_deploy(
        &self,
        mut endpoint: ServingEndpoint,
        adapter: &dyn FrameworkAdapter,
        target: &ResourceRef,
        err: AdapterError,
    ) -> ReconcileError {
        error!(endpoint_id = %endpoint.id, error = %err, "workload creation failed");
        self.cleanup(adapter, target).await;

        endpoint.set_status(EndpointStatus::Failed, Some(err.to_string()));
        if let Err(e) = self.store.commit(&endpoint, DeploymentWrite::Keep).await {
            error!(endpoint_id = %endpoint.id, error = %e, "could not record failed status");
        }
        err.into()
    }

    /// Best-effort removal of whatever a failed create left behind.
    async fn cleanup(&self, adapter: &dyn FrameworkAdapter, target: &ResourceRef) {
        match with_timeout(self.retry.delete_timeout, "delete", adapter.delete(target)).await {
            Ok(()) => info!(resource = %target, "removed partially created workload"),
            Err(AdapterError::NotFound(_)) => {}
            Err(e) => warn!(resource = %target, error = %e, "cleanup after failed create did not complete"),
        }
    }

    // ---- redeploy ----

    async fn redeploy_locked(
        &self,
        id: &str,
        overrides: RedeployOverrides,
    ) -> Result<LifecycleOutcome, ReconcileError> {
        let _guard = self.locks.acquire(id).await;

        let current = self.load(id).await?;
        if !current.status.can_redeploy() {
            return Err(ReconcileError::InvalidTransition {
                id: id.to_string(),
                op: "redeploy",
                status: current.status,
            });
        }
        let deployment = self.deployment_of(id).await?;
        let adapter = self.adapter(&current.serving_framework)?;
        let whitelist = &self.config.whitelist;

        // explicit override > stored spec > stored value
        let spec = match &overrides.deployment_spec {
            Override::Set(spec) => {
                validate(spec, whitelist)?;
                Some(spec.clone())
            }
            Override::Keep => current.deployment_spec.clone(),
        };
        let use_gpu = match overrides.use_gpu {
            Override::Set(v) => v,
            Override::Keep => spec.as_ref().map_or(current.use_gpu, |s| s.use_gpu),
        };
        let min_replicas = overrides.min_replicas.resolve(&current.min_replicas);
        let max_replicas = overrides.max_replicas.resolve(&current.max_replicas);
        validate_replicas(min_replicas, max_replicas, whitelist)?;
        let autoscale_policy = match &overrides.autoscale_policy {
            Override::Set(p) => Some(p.clone()),
            Override::Keep => current.autoscale_policy.clone(),
        };
        let requested = overrides.apply_resources(&current.requested_resources);

        // Re-resolve only when an image input changed; otherwise the stored
        // image (possibly an explicit or HuggingFace one) stays.
        let image_inputs_changed = use_gpu != current.use_gpu
            || !overrides.deployment_spec.is_keep()
            || current.runtime_image.is_none();
        let explicit = match &overrides.runtime_image {
            Override::Set(image) => Some(image.as_str()),
            Override::Keep if !image_inputs_changed => current.runtime_image.as_deref(),
            Override::Keep => None,
        };
        let resolved = self.resolver().resolve(&ImageQuery {
            explicit_image: explicit,
            spec: spec.as_ref(),
            model_metadata: None,
            use_gpu,
            requested: Some(&requested),
        })?;

        let mut desired = current.clone();
        desired.deployment_spec = spec;
        desired.use_gpu = use_gpu;
        desired.min_replicas = min_replicas;
        desired.max_replicas = max_replicas;
        desired.autoscale_policy = autoscale_policy;
        desired.requested_resources = requested;
        desired.resources = resolved.resources.clone();
        desired.runtime_image = Some(resolved.image.clone());

        let update = self.workload_update(&desired);
        let target = deployment.resource_ref();
        info!(
            endpoint_id = %id,
            resource = %target,
            image = %resolved.image,
            use_gpu,
            "redeploying"
        );
        let result = self
            .call_with_retry("update", self.retry.call_timeout, || {
                adapter.update(&target, &update)
            })
            .await;

        if let Err(e) = result {
            let mut degraded = current;
            degraded.set_status(EndpointStatus::Degraded, Some(format!("redeploy failed: {e}")));
            if let Err(se) = self.store.commit(&degraded, DeploymentWrite::Keep).await {
                error!(endpoint_id = %id, error = %se, "could not record degraded status");
            }
            return Err(e.into());
        }

        desired.rollback_plan = Some(current.snapshot());
        desired.set_status(EndpointStatus::Deploying, None);
        let deployment = self.deployment_for(&desired, deployment);
        let committed = self
            .store
            .commit(&desired, DeploymentWrite::Put(deployment.clone()))
            .await?;

        let (endpoint, deployment) = self
            .settle_after_update(adapter.as_ref(), committed, deployment)
            .await?;
        info!(endpoint_id = %id, status = %endpoint.status, "redeploy complete");
        Ok(LifecycleOutcome {
            endpoint,
            deployment: Some(deployment),
            warnings: resolved.warnings,
        })
    }

    // ---- rollback ----

    async fn rollback_locked(&self, id: &str) -> Result<LifecycleOutcome, ReconcileError> {
        let _guard = self.locks.acquire(id).await;

        let current = self.load(id).await?;
        if !current.status.can_rollback() {
            return Err(ReconcileError::InvalidTransition {
                id: id.to_string(),
                op: "rollback",
                status: current.status,
            });
        }
        let deployment = self.deployment_of(id).await?;
        let plan = current
            .rollback_plan
            .clone()
            .ok_or_else(|| ReconcileError::Conflict(format!("endpoint {id} has no rollback plan")))?;
        let adapter = self.adapter(&current.serving_framework)?;

        let mut desired = current.clone();
        apply_plan(&mut desired, plan);

        let update = self.workload_update(&desired);
        let target = deployment.resource_ref();
        info!(
            endpoint_id = %id,
            resource = %target,
            image = ?desired.runtime_image,
            "rolling back"
        );
        // A failed rollback leaves the endpoint exactly as it was.
        self.call_with_retry("update", self.retry.call_timeout, || {
            adapter.update(&target, &update)
        })
        .await?;

        desired.rollback_plan = Some(current.snapshot());
        desired.set_status(EndpointStatus::Rollback, None);
        let deployment = self.deployment_for(&desired, deployment);
        let committed = self
            .store
            .commit(&desired, DeploymentWrite::Put(deployment.clone()))
            .await?;

        let (endpoint, deployment) = self
            .settle_after_update(adapter.as_ref(), committed, deployment)
            .await?;
        info!(endpoint_id = %id, status = %endpoint.status, "rollback complete");
        Ok(LifecycleOutcome {
            endpoint,
            deployment: Some(deployment),
            warnings: Vec::new(),
        })
    }

    // ---- delete ----

    async fn delete_locked(&self, id: &str) -> Result<(), ReconcileError> {
        let _guard = self.locks.acquire(id).await;

        let endpoint = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))?;
        // Holding the lock means no lifecycle call is in flight, so a
        // `deploying` row here is a leftover and may be deleted.
        let adapter = self.adapter(&endpoint.serving_framework)?;
        let target = match self.store.get_deployment(id).await? {
            Some(dep) => dep.resource_ref(),
            None => ResourceRef {
                namespace: self.config.cluster.namespace_for(endpoint.environment),
                name: resource_name(id),
            },
        };

        info!(endpoint_id = %id, resource = %target, "deleting serving workload");
        let result = self
            .call_with_retry("delete", self.retry.delete_timeout, || adapter.delete(&target))
            .await;
        match result {
            Ok(()) => {}
            Err(AdapterError::NotFound(_)) => {
                debug!(endpoint_id = %id, resource = %target, "workload already absent");
            }
            Err(e) => {
                self.metrics
                    .consistency_guard_violations_total
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    endpoint_id = %id,
                    resource = %target,
                    error = %e,
                    "cluster removal not confirmed, keeping endpoint record"
                );
                return Err(ReconcileError::ConsistencyGuardViolation {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        self.store.remove(id).await?;
        info!(endpoint_id = %id, "endpoint deleted");
        Ok(())
    }

    // ---- shared ----

    async fn load(&self, id: &str) -> Result<ServingEndpoint, ReconcileError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(id.to_string()))
    }

    /// Deployment row of an endpoint that already passed its transition check.
    async fn deployment_of(&self, id: &str) -> Result<ServingDeployment, ReconcileError> {
        self.store.get_deployment(id).await?.ok_or_else(|| {
            ReconcileError::Conflict(format!("endpoint {id} has no deployed workload"))
        })
    }

    fn workload_update(&self, desired: &ServingEndpoint) -> WorkloadUpdate {
        let spec = desired.deployment_spec.as_ref();
        WorkloadUpdate {
            image: desired.runtime_image.clone(),
            resources: Some(WorkloadResources {
                quantities: desired.resources.clone(),
                gpus: gpu_count(desired.use_gpu, spec),
            }),
            scaling: Some(ScalingSpec {
                min_replicas: desired.min_replicas,
                max_replicas: desired.max_replicas,
                autoscale: desired.autoscale_policy.clone(),
            }),
            rollout: spec.and_then(|s| s.rollout.clone()),
        }
    }

    fn deployment_for(&self, ep: &ServingEndpoint, mut dep: ServingDeployment) -> ServingDeployment {
        dep.min_replicas = ep.min_replicas;
        dep.max_replicas = ep.max_replicas;
        dep.autoscaling_metrics = ep.autoscale_policy.clone();
        dep.resource_requests = requests_of(&ep.resources);
        dep.resource_limits = limits_of(&ep.resources);
        dep.updated_at = Utc::now();
        dep
    }

    /// Settle after an in-place update: ready promotes to healthy, anything
    /// else keeps the transitional status for the prober or operator.
    async fn settle_after_update(
        &self,
        adapter: &dyn FrameworkAdapter,
        mut endpoint: ServingEndpoint,
        mut deployment: ServingDeployment,
    ) -> Result<(ServingEndpoint, ServingDeployment), ReconcileError> {
        let Some(status) = self.settle(adapter, &deployment.resource_ref()).await else {
            return Ok((endpoint, deployment));
        };
        deployment.replica_count = status.replica_count;
        deployment.framework_status = status.raw_status.clone();
        deployment.updated_at = Utc::now();
        endpoint.last_health_check = Some(Utc::now());
        if status.is_ready() {
            endpoint.set_status(EndpointStatus::Healthy, None);
        }
        let endpoint = self
            .store
            .commit(&endpoint, DeploymentWrite::Put(deployment.clone()))
            .await?;
        Ok((endpoint, deployment))
    }
}

fn apply_plan(ep: &mut ServingEndpoint, plan: RollbackPlan) {
    ep.runtime_image = plan.runtime_image;
    ep.use_gpu = plan.use_gpu;
    ep.requested_resources = plan.requested_resources;
    ep.resources = plan.resources;
    ep.min_replicas = plan.min_replicas;
    ep.max_replicas = plan.max_replicas;
    ep.autoscale_policy = plan.autoscale_policy;
    ep.deployment_spec = plan.deployment_spec;
}

fn requests_of(q: &ResourceQuantities) -> ResourceQuantities {
    ResourceQuantities {
        cpu_request: q.cpu_request.clone(),
        memory_request: q.memory_request.clone(),
        ..Default::default()
    }
}

fn limits_of(q: &ResourceQuantities) -> ResourceQuantities {
    ResourceQuantities {
        cpu_limit: q.cpu_limit.clone(),
        memory_limit: q.memory_limit.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::tests::gpu_spec;

    #[test]
    fn gpu_count_follows_flag_then_spec() {
        let spec = gpu_spec();
        assert_eq!(gpu_count(false, Some(&spec)), 0);
        assert_eq!(gpu_count(true, Some(&spec)), 1);
        assert_eq!(gpu_count(true, None), 1);

        let mut big = gpu_spec();
        big.resources.gpus = 4;
        assert_eq!(gpu_count(true, Some(&big)), 4);
    }

    #[test]
    fn plan_restores_every_config_field() {
        let now = Utc::now();
        let mut ep = ServingEndpoint {
            id: "a".into(),
            model_entry_id: "m".into(),
            environment: keel_common::Environment::Dev,
            route: "/v1/a".into(),
            status: EndpointStatus::Healthy,
            status_reason: None,
            min_replicas: 3,
            max_replicas: 5,
            runtime_image: Some("img:b".into()),
            use_gpu: false,
            requested_resources: ResourceQuantities::default(),
            resources: ResourceQuantities::default(),
            autoscale_policy: None,
            deployment_spec: None,
            serving_framework: "kubernetes".into(),
            created_at: now,
            last_health_check: None,
            rollback_plan: None,
            revision: 4,
        };
        let plan = RollbackPlan {
            runtime_image: Some("img:a".into()),
            use_gpu: true,
            requested_resources: ResourceQuantities::default(),
            resources: ResourceQuantities {
                cpu_limit: Some("8".into()),
                ..Default::default()
            },
            min_replicas: 1,
            max_replicas: 2,
            autoscale_policy: None,
            deployment_spec: Some(gpu_spec()),
            captured_at: now,
        };
        apply_plan(&mut ep, plan);
        assert_eq!(ep.runtime_image.as_deref(), Some("img:a"));
        assert!(ep.use_gpu);
        assert_eq!(ep.min_replicas, 1);
        assert_eq!(ep.resources.cpu_limit.as_deref(), Some("8"));
        assert!(ep.deployment_spec.is_some());
        assert_eq!(ep.revision, 4);
    }

    #[test]
    fn deployment_row_splits_requests_and_limits() {
        let q = ResourceQuantities {
            cpu_request: Some("1".into()),
            cpu_limit: Some("2".into()),
            memory_request: Some("2Gi".into()),
            memory_limit: Some("4Gi".into()),
        };
        assert_eq!(requests_of(&q).cpu_limit, None);
        assert_eq!(requests_of(&q).memory_request.as_deref(), Some("2Gi"));
        assert_eq!(limits_of(&q).cpu_limit.as_deref(), Some("2"));
        assert_eq!(limits_of(&q).cpu_request, None);
    }
}
