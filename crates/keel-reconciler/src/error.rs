use thiserror::Error;

use keel_common::EndpointStatus;
use keel_meta::StoreError;

use crate::adapter::AdapterError;
use crate::image_policy::PolicyError;
use crate::validator::Rejection;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Caller error; nothing was written and the cluster was not called.
    #[error("validation rejected: {0}")]
    ValidationRejected(#[from] Rejection),

    #[error("image policy: {0}")]
    ImagePolicy(#[from] PolicyError),

    #[error("endpoint {0} not found")]
    NotFound(String),

    #[error("cannot {op} endpoint {id} while it is {status}")]
    InvalidTransition {
        id: String,
        op: &'static str,
        status: EndpointStatus,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no adapter registered for serving framework {0}")]
    UnknownFramework(String),

    /// Retryable; store and cluster are consistent.
    #[error("transient cluster error: {0}")]
    TransientCluster(String),

    #[error("permanent cluster error: {0}")]
    PermanentCluster(String),

    /// Delete could not confirm cluster removal. The endpoint row was kept.
    #[error("consistency guard: endpoint {id} kept, cluster removal not confirmed: {reason}")]
    ConsistencyGuardViolation { id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AdapterError> for ReconcileError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Transient(m) => ReconcileError::TransientCluster(m),
            AdapterError::Permanent(m) => ReconcileError::PermanentCluster(m),
            // An update target that vanished is drift, not a missing endpoint.
            AdapterError::NotFound(m) => {
                ReconcileError::Conflict(format!("cluster resource {m} is missing"))
            }
        }
    }
}

impl ReconcileError {
    /// Stable machine-readable code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::ValidationRejected(_) => "validation_rejected",
            ReconcileError::ImagePolicy(_) => "image_policy",
            ReconcileError::NotFound(_) => "not_found",
            ReconcileError::InvalidTransition { .. } => "invalid_transition",
            ReconcileError::Conflict(_) => "conflict",
            ReconcileError::UnknownFramework(_) => "unknown_framework",
            ReconcileError::TransientCluster(_) => "transient_cluster",
            ReconcileError::PermanentCluster(_) => "permanent_cluster",
            ReconcileError::ConsistencyGuardViolation { .. } => "consistency_guard_violation",
            ReconcileError::Store(StoreError::Conflict(_)) => "conflict",
            ReconcileError::Store(_) => "store",
            ReconcileError::Internal(_) => "internal",
        }
    }
}
