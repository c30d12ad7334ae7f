use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deployment_spec::{JobType, ServeTarget};
use crate::endpoint::{Environment, ResourceQuantities};

pub const ENV_IMAGE_PREFIX: &str = "KEEL_IMAGE_";
pub const ENV_DEFAULT_RUNTIME_IMAGE: &str = "KEEL_DEFAULT_RUNTIME_IMAGE";
pub const ENV_TGI_IMAGE_GPU: &str = "KEEL_TGI_IMAGE_GPU";
pub const ENV_TGI_IMAGE_CPU: &str = "KEEL_TGI_IMAGE_CPU";
pub const ENV_FRAMEWORK_PREFIX: &str = "KEEL_FRAMEWORK_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read policy config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid policy config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid environment override {name}: {reason}")]
    InvalidEnv { name: String, reason: String },

    #[error("invalid policy config: {0}")]
    Invalid(String),

    #[error("platform config already installed")]
    AlreadyInstalled,
}

/// Table key for an image binding: `TARGET[:JOB_TYPE]:gpu|cpu`.
pub fn image_key(target: ServeTarget, job_type: Option<JobType>, use_gpu: bool) -> String {
    let accel = if use_gpu { "gpu" } else { "cpu" };
    match job_type {
        Some(job) => format!("{}:{}:{}", target, job, accel),
        None => format!("{}:{}", target, accel),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImagePolicyConfig {
    /// Keyed by [`image_key`]. Job-type keys are more specific than target keys.
    pub table: BTreeMap<String, String>,
    /// text-generation-inference images used when only a HuggingFace id is known.
    pub tgi_gpu: Option<String>,
    pub tgi_cpu: Option<String>,
    pub default_image: Option<String>,
}

impl Default for ImagePolicyConfig {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(
            image_key(ServeTarget::Generation, None, true),
            "vllm/vllm-openai:v0.6.3".to_string(),
        );
        table.insert(
            image_key(ServeTarget::Generation, None, false),
            "ghcr.io/ggerganov/llama.cpp:server".to_string(),
        );
        table.insert(
            image_key(ServeTarget::Generation, Some(JobType::Embedding), true),
            "ghcr.io/huggingface/text-embeddings-inference:1.5".to_string(),
        );
        table.insert(
            image_key(ServeTarget::Generation, Some(JobType::Embedding), false),
            "ghcr.io/huggingface/text-embeddings-inference:cpu-1.5".to_string(),
        );
        table.insert(
            image_key(ServeTarget::Rag, None, true),
            "registry.internal/serving/rag-runtime:0.9.0-cuda".to_string(),
        );
        table.insert(
            image_key(ServeTarget::Rag, None, false),
            "registry.internal/serving/rag-runtime:0.9.0-cpu".to_string(),
        );
        Self {
            table,
            tgi_gpu: Some("ghcr.io/huggingface/text-generation-inference:2.4.0".to_string()),
            tgi_cpu: Some("ghcr.io/huggingface/text-generation-inference:2.4.0-intel-cpu".to_string()),
            default_image: Some("registry.internal/serving/default-runtime:latest".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceProfiles {
    pub gpu: ResourceQuantities,
    pub cpu: ResourceQuantities,
}

impl Default for ResourceProfiles {
    fn default() -> Self {
        Self {
            gpu: ResourceQuantities {
                cpu_request: Some("4".into()),
                cpu_limit: Some("8".into()),
                memory_request: Some("16Gi".into()),
                memory_limit: Some("32Gi".into()),
            },
            cpu: ResourceQuantities {
                cpu_request: Some("1".into()),
                cpu_limit: Some("2".into()),
                memory_request: Some("2Gi".into()),
                memory_limit: Some("4Gi".into()),
            },
        }
    }
}

impl ResourceProfiles {
    pub fn for_gpu(&self, use_gpu: bool) -> &ResourceQuantities {
        if use_gpu {
            &self.gpu
        } else {
            &self.cpu
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Whitelist {
    pub model_families: BTreeSet<String>,
    pub job_types: BTreeSet<JobType>,
    pub max_gpus: u32,
    pub max_replicas: u32,
}

impl Default for Whitelist {
    fn default() -> Self {
        Self {
            model_families: ["llama", "mistral", "qwen", "gemma", "phi", "bert", "bge", "e5"]
                .into_iter()
                .map(String::from)
                .collect(),
            job_types: JobType::ALL.into_iter().collect(),
            max_gpus: 8,
            max_replicas: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameworkDefaults {
    pub per_environment: BTreeMap<Environment, String>,
    pub fallback: String,
}

impl Default for FrameworkDefaults {
    fn default() -> Self {
        let mut per_environment = BTreeMap::new();
        per_environment.insert(Environment::Dev, "kubernetes".to_string());
        per_environment.insert(Environment::Stg, "kserve".to_string());
        per_environment.insert(Environment::Prod, "kserve".to_string());
        Self {
            per_environment,
            fallback: "kubernetes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterSettings {
    /// Namespace per environment. Missing entries use `serving-<env>`.
    pub namespaces: BTreeMap<Environment, String>,
    pub container_port: u16,
    pub ingress_class: Option<String>,
    pub delete_poll_interval_ms: u64,
    pub delete_confirm_timeout_ms: u64,
    pub ray_version: String,
    pub ray_import_path: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespaces: BTreeMap::new(),
            container_port: 8080,
            ingress_class: None,
            delete_poll_interval_ms: 1_000,
            delete_confirm_timeout_ms: 60_000,
            ray_version: "2.9.0".to_string(),
            ray_import_path: "serving.app:deployment".to_string(),
        }
    }
}

impl ClusterSettings {
    pub fn namespace_for(&self, env: Environment) -> String {
        self.namespaces
            .get(&env)
            .cloned()
            .unwrap_or_else(|| format!("serving-{}", env))
    }

    pub fn delete_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delete_poll_interval_ms)
    }

    pub fn delete_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_confirm_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
    /// Budget for one adapter delete. Must exceed
    /// `cluster.delete_confirm_timeout_ms`, which bounds the whole confirmation wait.
    pub delete_timeout_ms: u64,
    pub settle_probes: u32,
    pub settle_interval_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            call_timeout_ms: 30_000,
            delete_timeout_ms: 90_000,
            settle_probes: 3,
            settle_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthProbeSettings {
    pub interval_secs: u64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthProbeSettings {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Operator-owned policy data consumed by the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PlatformConfig {
    pub images: ImagePolicyConfig,
    pub resource_profiles: ResourceProfiles,
    pub whitelist: Whitelist,
    pub frameworks: FrameworkDefaults,
    pub cluster: ClusterSettings,
    pub lifecycle: LifecycleSettings,
    pub health: HealthProbeSettings,
}

impl PlatformConfig {
    /// Defaults, overlaid by the JSON file at `path` (if any), then by `KEEL_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(std::env::vars())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that contradict each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let confirm = self.cluster.delete_confirm_timeout_ms;
        let budget = self.lifecycle.delete_timeout_ms;
        if budget <= confirm {
            return Err(ConfigError::Invalid(format!(
                "lifecycle.delete_timeout_ms ({budget}) must exceed cluster.delete_confirm_timeout_ms ({confirm})"
            )));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Apply `KEEL_IMAGE_*`, `KEEL_TGI_IMAGE_*`, `KEEL_DEFAULT_RUNTIME_IMAGE` and
    /// `KEEL_FRAMEWORK_*` overrides.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if value.is_empty() {
                continue;
            }
            if name == ENV_DEFAULT_RUNTIME_IMAGE {
                self.images.default_image = Some(value);
            } else if name == ENV_TGI_IMAGE_GPU {
                self.images.tgi_gpu = Some(value);
            } else if name == ENV_TGI_IMAGE_CPU {
                self.images.tgi_cpu = Some(value);
            } else if let Some(rest) = name.strip_prefix(ENV_IMAGE_PREFIX) {
                let key = parse_image_env_key(rest).map_err(|reason| ConfigError::InvalidEnv {
                    name: name.clone(),
                    reason,
                })?;
                self.images.table.insert(key, value);
            } else if let Some(rest) = name.strip_prefix(ENV_FRAMEWORK_PREFIX) {
                let env: Environment =
                    rest.to_ascii_lowercase()
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv {
                            name: name.clone(),
                            reason: "expected DEV, STG or PROD suffix".to_string(),
                        })?;
                self.frameworks.per_environment.insert(env, value);
            }
        }
        Ok(())
    }

    pub fn framework_for(&self, env: Environment) -> &str {
        self.frameworks
            .per_environment
            .get(&env)
            .map(String::as_str)
            .unwrap_or(&self.frameworks.fallback)
    }
}

/// `GENERATION_GPU` -> `GENERATION:gpu`, `RAG_RAG_TUNING_CPU` -> `RAG:RAG_TUNING:cpu`.
fn parse_image_env_key(rest: &str) -> Result<String, String> {
    let (head, accel) = rest
        .rsplit_once('_')
        .ok_or_else(|| "expected <TARGET>[_<JOB_TYPE>]_<GPU|CPU>".to_string())?;
    let use_gpu = match accel {
        "GPU" => true,
        "CPU" => false,
        other => return Err(format!("unknown accelerator suffix {other}")),
    };
    let (target, job) = match head.split_once('_') {
        Some((t, j)) => (t, Some(j)),
        None => (head, None),
    };
    let target: ServeTarget = target
        .parse()
        .map_err(|t| format!("unknown serve target {t}"))?;
    let job = job
        .map(|j| j.parse::<JobType>().map_err(|j| format!("unknown job type {j}")))
        .transpose()?;
    Ok(image_key(target, job, use_gpu))
}

static PLATFORM: OnceLock<Arc<PlatformConfig>> = OnceLock::new();

/// Install the process-wide config. Only the first call succeeds.
pub fn install(cfg: PlatformConfig) -> Result<Arc<PlatformConfig>, ConfigError> {
    let cfg = Arc::new(cfg);
    PLATFORM
        .set(cfg.clone())
        .map_err(|_| ConfigError::AlreadyInstalled)?;
    Ok(cfg)
}

pub fn current() -> Option<Arc<PlatformConfig>> {
    PLATFORM.get().cloned()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_extend_the_image_table() {
        let mut cfg = PlatformConfig::default();
        cfg.apply_env(vars(&[
            ("KEEL_IMAGE_GENERATION_RLHF_GPU", "registry.internal/rlhf:1"),
            ("KEEL_IMAGE_RAG_CPU", "registry.internal/rag:cpu-2"),
            ("KEEL_FRAMEWORK_DEV", "ray"),
            ("KEEL_DEFAULT_RUNTIME_IMAGE", "registry.internal/default:2"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        assert_eq!(
            cfg.images.table.get("GENERATION:RLHF:gpu").map(String::as_str),
            Some("registry.internal/rlhf:1")
        );
        assert_eq!(
            cfg.images.table.get("RAG:cpu").map(String::as_str),
            Some("registry.internal/rag:cpu-2")
        );
        assert_eq!(cfg.framework_for(Environment::Dev), "ray");
        assert_eq!(
            cfg.images.default_image.as_deref(),
            Some("registry.internal/default:2")
        );
    }

    #[test]
    fn rag_tuning_job_key_keeps_inner_underscore() {
        assert_eq!(
            parse_image_env_key("RAG_RAG_TUNING_GPU").unwrap(),
            "RAG:RAG_TUNING:gpu"
        );
        assert!(parse_image_env_key("GENERATION_TPU").is_err());
        assert!(parse_image_env_key("CHAT_GPU").is_err());
    }

    #[test]
    fn delete_budget_must_cover_the_confirmation_wait() {
        let mut cfg = PlatformConfig::default();
        cfg.validate().unwrap();

        cfg.cluster.delete_confirm_timeout_ms = cfg.lifecycle.delete_timeout_ms;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("delete_timeout_ms")));
    }

    #[test]
    fn bad_framework_env_is_rejected() {
        let mut cfg = PlatformConfig::default();
        let err = cfg
            .apply_env(vars(&[("KEEL_FRAMEWORK_QA", "kserve")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "whitelist": {{"model_families": ["llama"], "max_gpus": 2}},
                "cluster": {{"namespaces": {{"prod": "inference-prod"}}}}
            }}"#
        )
        .unwrap();

        let cfg = PlatformConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.whitelist.max_gpus, 2);
        assert!(cfg.whitelist.model_families.contains("llama"));
        assert!(!cfg.whitelist.model_families.contains("qwen"));
        assert_eq!(cfg.whitelist.job_types.len(), 5);
        assert_eq!(cfg.cluster.namespace_for(Environment::Prod), "inference-prod");
        assert_eq!(cfg.cluster.namespace_for(Environment::Dev), "serving-dev");
        assert_eq!(cfg.lifecycle, LifecycleSettings::default());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = PlatformConfig::from_file(Path::new("/nonexistent/keel.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/keel.json"));
    }
}
