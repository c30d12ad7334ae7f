use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

/// Lifecycle operations tracked per-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Deploy,
    Redeploy,
    Rollback,
    Delete,
}

impl Op {
    pub const ALL: [Op; 4] = [Op::Deploy, Op::Redeploy, Op::Rollback, Op::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Deploy => "deploy",
            Op::Redeploy => "redeploy",
            Op::Rollback => "rollback",
            Op::Delete => "delete",
        }
    }

    fn index(&self) -> usize {
        match self {
            Op::Deploy => 0,
            Op::Redeploy => 1,
            Op::Rollback => 2,
            Op::Delete => 3,
        }
    }
}

/// Shared reconciler counters, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    lifecycle_total: [AtomicU64; 4],
    lifecycle_failures: [AtomicU64; 4],
    /// Transient adapter errors that were retried.
    pub adapter_retries_total: AtomicU64,
    /// Deletes refused because cluster removal was not confirmed.
    pub consistency_guard_violations_total: AtomicU64,
    /// Health probe passes.
    pub probe_runs_total: AtomicU64,
    /// Individual endpoint status reads that failed.
    pub probe_errors_total: AtomicU64,
    /// Deployment rows whose cluster resource is missing.
    pub drift_detected_total: AtomicU64,
}

impl SharedMetrics {
    pub fn record(&self, op: Op, ok: bool) {
        self.lifecycle_total[op.index()].fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.lifecycle_failures[op.index()].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn lifecycle_total(&self, op: Op) -> u64 {
        self.lifecycle_total[op.index()].load(Ordering::Relaxed)
    }

    pub fn lifecycle_failures(&self, op: Op) -> u64 {
        self.lifecycle_failures[op.index()].load(Ordering::Relaxed)
    }

    pub fn render(&self) -> String {
        let mut body = String::new();
        body.push_str(
            "# HELP keel_reconciler_lifecycle_total Lifecycle operations by type.\n\
             # TYPE keel_reconciler_lifecycle_total counter\n",
        );
        for op in Op::ALL {
            let _ = writeln!(
                body,
                "keel_reconciler_lifecycle_total{{op=\"{}\"}} {}",
                op.as_str(),
                self.lifecycle_total(op)
            );
        }
        body.push_str(
            "# HELP keel_reconciler_lifecycle_failures_total Failed lifecycle operations by type.\n\
             # TYPE keel_reconciler_lifecycle_failures_total counter\n",
        );
        for op in Op::ALL {
            let _ = writeln!(
                body,
                "keel_reconciler_lifecycle_failures_total{{op=\"{}\"}} {}",
                op.as_str(),
                self.lifecycle_failures(op)
            );
        }
        let _ = write!(
            body,
            "# HELP keel_reconciler_adapter_retries_total Transient adapter errors retried.\n\
             # TYPE keel_reconciler_adapter_retries_total counter\n\
             keel_reconciler_adapter_retries_total {}\n\
             # HELP keel_reconciler_consistency_guard_violations_total Deletes refused for unconfirmed cluster removal.\n\
             # TYPE keel_reconciler_consistency_guard_violations_total counter\n\
             keel_reconciler_consistency_guard_violations_total {}\n\
             # HELP keel_reconciler_probe_runs_total Health probe passes.\n\
             # TYPE keel_reconciler_probe_runs_total counter\n\
             keel_reconciler_probe_runs_total {}\n\
             # HELP keel_reconciler_probe_errors_total Failed endpoint status reads.\n\
             # TYPE keel_reconciler_probe_errors_total counter\n\
             keel_reconciler_probe_errors_total {}\n\
             # HELP keel_reconciler_drift_detected_total Deployment rows without a cluster resource.\n\
             # TYPE keel_reconciler_drift_detected_total counter\n\
             keel_reconciler_drift_detected_total {}\n",
            self.adapter_retries_total.load(Ordering::Relaxed),
            self.consistency_guard_violations_total.load(Ordering::Relaxed),
            self.probe_runs_total.load(Ordering::Relaxed),
            self.probe_errors_total.load(Ordering::Relaxed),
            self.drift_detected_total.load(Ordering::Relaxed),
        );
        body
    }
}

/// GET /metrics: Prometheus text exposition format.
pub async fn metrics_handler(State(metrics): State<Arc<SharedMetrics>>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, metrics.render())
}

/// GET /healthz: liveness probe.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}
