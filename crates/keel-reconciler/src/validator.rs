use std::fmt;

use keel_common::config::Whitelist;
use keel_common::{DeploymentSpec, ServeTarget};

/// Why a spec was refused. Carries the offending field so callers can point at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub field: &'static str,
    pub reason: String,
}

impl Rejection {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for Rejection {}

/// Checks a `DeploymentSpec` against the whitelist. Pure; never touches the cluster.
pub fn validate(spec: &DeploymentSpec, whitelist: &Whitelist) -> Result<(), Rejection> {
    if spec.model_ref.trim().is_empty() {
        return Err(Rejection::new("model_ref", "must not be empty"));
    }

    if !whitelist.model_families.contains(&spec.model_family) {
        return Err(Rejection::new(
            "model_family",
            format!("{} is not whitelisted", spec.model_family),
        ));
    }

    let job_type = spec
        .parsed_job_type()
        .filter(|j| whitelist.job_types.contains(j))
        .ok_or_else(|| {
            Rejection::new("job_type", format!("{} is not whitelisted", spec.job_type))
        })?;

    let serve_target: ServeTarget = spec.parsed_serve_target().ok_or_else(|| {
        Rejection::new(
            "serve_target",
            format!("{} is not one of GENERATION, RAG", spec.serve_target),
        )
    })?;

    if !serve_target.accepts(job_type) {
        return Err(Rejection::new(
            "serve_target",
            format!("{serve_target} cannot serve a {job_type} model"),
        ));
    }

    let runtime = [
        ("runtime.max_concurrent_requests", spec.runtime.max_concurrent_requests),
        ("runtime.max_input_tokens", spec.runtime.max_input_tokens),
        ("runtime.max_output_tokens", spec.runtime.max_output_tokens),
    ];
    for (field, value) in runtime {
        match value {
            None => return Err(Rejection::new(field, "is required")),
            Some(v) if v <= 0 => return Err(Rejection::new(field, format!("must be > 0, got {v}"))),
            Some(_) => {}
        }
    }

    let gpus = spec.resources.gpus;
    if gpus < 0 {
        return Err(Rejection::new(
            "resources.gpus",
            format!("must be >= 0, got {gpus}"),
        ));
    }
    if gpus > i64::from(whitelist.max_gpus) {
        return Err(Rejection::new(
            "resources.gpus",
            format!("exceeds the limit of {}", whitelist.max_gpus),
        ));
    }
    if spec.use_gpu != (gpus > 0) {
        return Err(Rejection::new(
            "use_gpu",
            format!("use_gpu={} does not match resources.gpus={gpus}", spec.use_gpu),
        ));
    }
    if let Some(mem) = spec.resources.gpu_memory_gb {
        if !(mem > 0.0) {
            return Err(Rejection::new(
                "resources.gpu_memory_gb",
                "must be positive when set",
            ));
        }
    }

    if let Some(split) = spec.rollout.as_ref().and_then(|r| r.traffic_split) {
        if split.old + split.new != 100 {
            return Err(Rejection::new(
                "rollout.traffic_split",
                format!("old + new must equal 100, got {}", split.old + split.new),
            ));
        }
    }

    Ok(())
}

/// Bounds that apply to every deploy/redeploy, with or without a spec.
pub fn validate_replicas(min: u32, max: u32, whitelist: &Whitelist) -> Result<(), Rejection> {
    if min < 1 {
        return Err(Rejection::new("min_replicas", "must be >= 1"));
    }
    if max < min {
        return Err(Rejection::new(
            "max_replicas",
            format!("must be >= min_replicas ({min}), got {max}"),
        ));
    }
    if max > whitelist.max_replicas {
        return Err(Rejection::new(
            "max_replicas",
            format!("exceeds the limit of {}", whitelist.max_replicas),
        ));
    }
    Ok(())
}

pub fn validate_route(route: &str) -> Result<(), Rejection> {
    if !route.starts_with('/') || route.len() < 2 {
        return Err(Rejection::new("route", "must be an absolute path like /v1/models/name"));
    }
    if route.chars().any(char::is_whitespace) {
        return Err(Rejection::new("route", "must not contain whitespace"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use keel_common::{Rollout, RolloutStrategy, RuntimeLimits, SpecResources, TrafficSplit};

    use super::*;

    pub(crate) fn gpu_spec() -> DeploymentSpec {
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

    fn rejected_field(spec: &DeploymentSpec) -> &'static str {
        validate(spec, &Whitelist::default()).unwrap_err().field
    }

    #[test]
    fn accepts_a_well_formed_spec() {
        assert!(validate(&gpu_spec(), &Whitelist::default()).is_ok());
    }

    #[test]
    fn rejects_unknown_model_family() {
        let spec = DeploymentSpec {
            model_family: "unknown-arch".to_string(),
            ..gpu_spec()
        };
        assert_eq!(rejected_field(&spec), "model_family");
    }

    #[test]
    fn rejects_unknown_job_type() {
        let spec = DeploymentSpec {
            job_type: "DISTILL".to_string(),
            ..gpu_spec()
        };
        assert_eq!(rejected_field(&spec), "job_type");
    }

    #[test]
    fn serve_target_must_match_job_type() {
        let sft_as_rag = DeploymentSpec {
            serve_target: "RAG".to_string(),
            ..gpu_spec()
        };
        assert_eq!(rejected_field(&sft_as_rag), "serve_target");

        let rag_as_generation = DeploymentSpec {
            job_type: "RAG_TUNING".to_string(),
            ..gpu_spec()
        };
        assert_eq!(rejected_field(&rag_as_generation), "serve_target");

        let rag = DeploymentSpec {
            job_type: "RAG_TUNING".to_string(),
            serve_target: "RAG".to_string(),
            ..gpu_spec()
        };
        assert!(validate(&rag, &Whitelist::default()).is_ok());
    }

    #[test]
    fn runtime_limits_are_required_and_positive() {
        let mut spec = gpu_spec();
        spec.runtime.max_input_tokens = None;
        assert_eq!(rejected_field(&spec), "runtime.max_input_tokens");

        let mut spec = gpu_spec();
        spec.runtime.max_output_tokens = Some(0);
        assert_eq!(rejected_field(&spec), "runtime.max_output_tokens");
    }

    #[test]
    fn gpu_flag_must_agree_with_gpu_count() {
        let mut spec = gpu_spec();
        spec.resources.gpus = -1;
        assert_eq!(rejected_field(&spec), "resources.gpus");

        let mut spec = gpu_spec();
        spec.use_gpu = false;
        assert_eq!(rejected_field(&spec), "use_gpu");

        let mut spec = gpu_spec();
        spec.resources.gpus = 0;
        spec.resources.gpu_memory_gb = None;
        assert_eq!(rejected_field(&spec), "use_gpu");
        spec.use_gpu = false;
        assert!(validate(&spec, &Whitelist::default()).is_ok());
    }

    #[test]
    fn traffic_split_must_sum_to_100() {
        let mut spec = gpu_spec();
        spec.rollout = Some(Rollout {
            strategy: RolloutStrategy::Canary,
            traffic_split: Some(TrafficSplit { old: 80, new: 10 }),
        });
        assert_eq!(rejected_field(&spec), "rollout.traffic_split");
    }

    #[test]
    fn replica_bounds() {
        let wl = Whitelist::default();
        assert!(validate_replicas(1, 1, &wl).is_ok());
        assert_eq!(validate_replicas(0, 1, &wl).unwrap_err().field, "min_replicas");
        assert_eq!(validate_replicas(3, 2, &wl).unwrap_err().field, "max_replicas");
        assert_eq!(validate_replicas(1, 65, &wl).unwrap_err().field, "max_replicas");
    }

    #[test]
    fn routes_are_absolute_paths() {
        assert!(validate_route("/v1/models/support-bot").is_ok());
        assert!(validate_route("v1/models").is_err());
        assert!(validate_route("/").is_err());
        assert!(validate_route("/v1/my model").is_err());
    }
}
