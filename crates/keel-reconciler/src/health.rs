use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use keel_common::{EndpointFilter, EndpointStatus};
use keel_meta::{DeploymentWrite, StoreError};

use crate::adapter::{AdapterError, FrameworkStatus};
use crate::engine::ReconciliationEngine;
use crate::retry::with_timeout;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Streak {
    ready: u32,
    not_ready: u32,
}

/// What one probe did to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Unchanged,
    Transitioned(EndpointStatus),
    /// Endpoint was busy or left probe-managed states before the write.
    Skipped,
    Drift,
    Error,
}

/// Periodically reads framework status for deployed endpoints and moves them
/// between deploying, healthy and degraded after consecutive agreeing probes.
///
/// Never touches failed or rollback endpoints; those need an operator call.
pub struct HealthProber {
    engine: ReconciliationEngine,
    streaks: DashMap<String, Streak>,
}

impl HealthProber {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self {
            engine,
            streaks: DashMap::new(),
        }
    }

    pub async fn run(self) {
        let interval = Duration::from_secs(self.engine.config().health.interval_secs.max(1));
        info!("health prober started (interval={}s)", interval.as_secs());
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.probe_all().await {
                warn!(error=%e, "health probe pass failed");
            }
        }
    }

    pub async fn probe_all(&self) -> Result<Vec<(String, ProbeOutcome)>, StoreError> {
        self.engine
            .metrics()
            .probe_runs_total
            .fetch_add(1, Ordering::Relaxed);

        let endpoints = self.engine.store().list(&EndpointFilter::default()).await?;
        let mut outcomes = Vec::new();
        for ep in endpoints {
            if !ep.status.is_probe_managed() {
                self.streaks.remove(&ep.id);
                continue;
            }
            let outcome = self.probe_one(&ep.id).await;
            outcomes.push((ep.id, outcome));
        }
        // Forget endpoints that are gone.
        let live: std::collections::HashSet<&str> =
            outcomes.iter().map(|(id, _)| id.as_str()).collect();
        self.streaks.retain(|id, _| live.contains(id.as_str()));
        Ok(outcomes)
    }

    pub async fn probe_one(&self, id: &str) -> ProbeOutcome {
        // Lifecycle calls own the endpoint; try again next pass.
        let Some(_guard) = self.engine.locks().try_acquire(id) else {
            debug!(endpoint_id = %id, "endpoint busy, skipping probe");
            return ProbeOutcome::Skipped;
        };

        let store = self.engine.store();
        let (endpoint, deployment) = match (store.get(id).await, store.get_deployment(id).await) {
            (Ok(Some(ep)), Ok(Some(dep))) => (ep, dep),
            (Ok(_), Ok(None)) | (Ok(None), _) => return ProbeOutcome::Skipped,
            (Err(e), _) | (_, Err(e)) => {
                warn!(endpoint_id = %id, error = %e, "probe could not load endpoint");
                return ProbeOutcome::Error;
            }
        };
        if !endpoint.status.is_probe_managed() {
            return ProbeOutcome::Skipped;
        }
        let adapter = match self.engine.adapter(&endpoint.serving_framework) {
            Ok(a) => a,
            Err(e) => {
                warn!(endpoint_id = %id, error = %e, "probe has no adapter");
                return ProbeOutcome::Error;
            }
        };

        let target = deployment.resource_ref();
        let limit = self.engine.retry_policy().call_timeout;
        let (status, failed_read) =
            match with_timeout(limit, "fetch_status", adapter.fetch_status(&target)).await {
                Ok(s) => (Some(s), None),
                Err(AdapterError::NotFound(_)) => {
                    self.engine
                        .metrics()
                        .drift_detected_total
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(endpoint_id = %id, resource = %target, "deployment row has no cluster resource");
                    (None, Some(ProbeOutcome::Drift))
                }
                Err(e) => {
                    self.engine
                        .metrics()
                        .probe_errors_total
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint_id = %id, error = %e, "status read failed");
                    (None, Some(ProbeOutcome::Error))
                }
            };

        // Missing or unreadable workloads count as not ready.
        let settings = &self.engine.config().health;
        let ready = status.as_ref().is_some_and(FrameworkStatus::is_ready);
        let streak = {
            let mut s = self.streaks.entry(id.to_string()).or_default();
            if ready {
                s.ready += 1;
                s.not_ready = 0;
            } else {
                s.not_ready += 1;
                s.ready = 0;
            }
            *s
        };

        let next = if ready
            && streak.ready >= settings.healthy_threshold.max(1)
            && endpoint.status != EndpointStatus::Healthy
        {
            Some(EndpointStatus::Healthy)
        } else if !ready
            && streak.not_ready >= settings.unhealthy_threshold.max(1)
            && endpoint.status != EndpointStatus::Degraded
        {
            Some(EndpointStatus::Degraded)
        } else {
            None
        };

        let write = match status {
            Some(status) => {
                let mut dep = deployment;
                dep.replica_count = status.replica_count;
                dep.framework_status = status.raw_status;
                dep.updated_at = Utc::now();
                DeploymentWrite::Put(dep)
            }
            None if next.is_none() => return failed_read.unwrap_or(ProbeOutcome::Error),
            None => DeploymentWrite::Keep,
        };

        let mut updated = endpoint.clone();
        if failed_read.is_none() {
            updated.last_health_check = Some(Utc::now());
        }
        if let Some(next) = next {
            let reason = (next == EndpointStatus::Degraded).then(|| match failed_read {
                Some(ProbeOutcome::Drift) => format!(
                    "cluster resource missing for {} consecutive probes",
                    streak.not_ready
                ),
                Some(_) => format!("status unreadable for {} consecutive probes", streak.not_ready),
                None => format!("{} consecutive probes without a ready replica", streak.not_ready),
            });
            updated.set_status(next, reason);
        }

        match store.commit(&updated, write).await {
            Ok(_) => match next {
                Some(s) => {
                    info!(endpoint_id = %id, from = %endpoint.status, to = %s, "health transition");
                    ProbeOutcome::Transitioned(s)
                }
                None => ProbeOutcome::Unchanged,
            },
            Err(StoreError::Conflict(_)) => ProbeOutcome::Skipped,
            Err(e) => {
                warn!(endpoint_id = %id, error = %e, "probe could not record status");
                ProbeOutcome::Error
            }
        }
    }
}
