use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use keel_common::config::{image_key, ImagePolicyConfig, ResourceProfiles};
use keel_common::{DeploymentSpec, ModelMetadata, ResourceQuantities, ServeTarget};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no image binding for {key} and no default runtime image configured")]
    NoImage { key: String },

    #[error("deployment spec has an unparseable serve target or job type")]
    InvalidSpec,
}

/// Which rule produced the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Explicit,
    SpecTable,
    HuggingFace,
    Default,
}

#[derive(Debug, Clone, Default)]
pub struct ImageQuery<'a> {
    pub explicit_image: Option<&'a str>,
    pub spec: Option<&'a DeploymentSpec>,
    pub model_metadata: Option<&'a ModelMetadata>,
    pub use_gpu: bool,
    pub requested: Option<&'a ResourceQuantities>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    pub image: String,
    pub source: ImageSource,
    /// Requested quantities with the GPU or CPU profile filling the gaps.
    pub resources: ResourceQuantities,
    /// Non-fatal configuration problems the caller should surface.
    pub warnings: Vec<String>,
}

/// Picks a runtime image and default resource quantities.
///
/// Precedence: explicit image, spec image table, HuggingFace TGI image,
/// configured default.
pub struct ImagePolicyResolver<'a> {
    images: &'a ImagePolicyConfig,
    profiles: &'a ResourceProfiles,
}

impl<'a> ImagePolicyResolver<'a> {
    pub fn new(images: &'a ImagePolicyConfig, profiles: &'a ResourceProfiles) -> Self {
        Self { images, profiles }
    }

    pub fn resolve(&self, query: &ImageQuery<'_>) -> Result<ResolvedImage, PolicyError> {
        let resources = self.resources_for(query.use_gpu, query.requested);
        let mut warnings = Vec::new();

        if let Some(image) = query.explicit_image.filter(|i| !i.trim().is_empty()) {
            return Ok(ResolvedImage {
                image: image.to_string(),
                source: ImageSource::Explicit,
                resources,
                warnings,
            });
        }

        let accel = if query.use_gpu { "gpu" } else { "cpu" };
        let mut missing_key = format!("default:{accel}");

        if let Some(spec) = query.spec {
            let target = spec.parsed_serve_target().ok_or(PolicyError::InvalidSpec)?;
            let job = spec.parsed_job_type().ok_or(PolicyError::InvalidSpec)?;

            // RAG has one image family regardless of job type.
            let mut keys = Vec::with_capacity(2);
            if target != ServeTarget::Rag {
                keys.push(image_key(target, Some(job), query.use_gpu));
            }
            keys.push(image_key(target, None, query.use_gpu));

            if let Some(image) = keys.iter().find_map(|k| self.images.table.get(k)) {
                return Ok(ResolvedImage {
                    image: image.clone(),
                    source: ImageSource::SpecTable,
                    resources,
                    warnings,
                });
            }
            missing_key = keys.last().cloned().unwrap_or(missing_key);
        } else if query
            .model_metadata
            .and_then(|m| m.hf_model_id.as_deref())
            .is_some_and(|id| !id.trim().is_empty())
        {
            let tgi = if query.use_gpu {
                &self.images.tgi_gpu
            } else {
                &self.images.tgi_cpu
            };
            if let Some(image) = tgi {
                return Ok(ResolvedImage {
                    image: image.clone(),
                    source: ImageSource::HuggingFace,
                    resources,
                    warnings,
                });
            }
            missing_key = format!("tgi:{accel}");
        }

        let Some(default) = self.images.default_image.clone() else {
            return Err(PolicyError::NoImage { key: missing_key });
        };
        let msg = format!(
            "no {missing_key} image binding configured, using default runtime image {default}"
        );
        warn!(key = %missing_key, image = %default, "image policy fell back to default image");
        warnings.push(msg);

        Ok(ResolvedImage {
            image: default,
            source: ImageSource::Default,
            resources,
            warnings,
        })
    }

    pub fn resources_for(
        &self,
        use_gpu: bool,
        requested: Option<&ResourceQuantities>,
    ) -> ResourceQuantities {
        let profile = self.profiles.for_gpu(use_gpu);
        match requested {
            Some(r) => r.or_defaults(profile),
            None => profile.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::tests::gpu_spec;

    fn resolve(cfg: &ImagePolicyConfig, query: ImageQuery<'_>) -> Result<ResolvedImage, PolicyError> {
        let profiles = ResourceProfiles::default();
        ImagePolicyResolver::new(cfg, &profiles).resolve(&query)
    }

    #[test]
    fn explicit_image_wins() {
        let cfg = ImagePolicyConfig::default();
        let spec = gpu_spec();
        let r = resolve(
            &cfg,
            ImageQuery {
                explicit_image: Some("my/image:1"),
                spec: Some(&spec),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.image, "my/image:1");
        assert_eq!(r.source, ImageSource::Explicit);
    }

    #[test]
    fn spec_uses_gpu_or_cpu_table_entry() {
        let cfg = ImagePolicyConfig::default();
        let spec = gpu_spec();
        let gpu = resolve(
            &cfg,
            ImageQuery {
                spec: Some(&spec),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(gpu.image, "vllm/vllm-openai:v0.6.3");
        assert_eq!(gpu.resources.cpu_limit.as_deref(), Some("8"));

        let cpu = resolve(
            &cfg,
            ImageQuery {
                spec: Some(&spec),
                use_gpu: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cpu.image, "ghcr.io/ggerganov/llama.cpp:server");
        assert_eq!(cpu.resources.memory_limit.as_deref(), Some("4Gi"));
    }

    #[test]
    fn job_type_entry_is_more_specific_than_target_entry() {
        let cfg = ImagePolicyConfig::default();
        let mut spec = gpu_spec();
        spec.job_type = "EMBEDDING".to_string();
        let r = resolve(
            &cfg,
            ImageQuery {
                spec: Some(&spec),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.image, "ghcr.io/huggingface/text-embeddings-inference:1.5");
    }

    #[test]
    fn rag_always_uses_rag_image() {
        let mut cfg = ImagePolicyConfig::default();
        cfg.table
            .insert("RAG:RAG_TUNING:gpu".to_string(), "ignored:1".to_string());
        let mut spec = gpu_spec();
        spec.job_type = "RAG_TUNING".to_string();
        spec.serve_target = "RAG".to_string();
        let r = resolve(
            &cfg,
            ImageQuery {
                spec: Some(&spec),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.image, "registry.internal/serving/rag-runtime:0.9.0-cuda");
    }

    #[test]
    fn huggingface_id_selects_tgi_when_no_spec() {
        let cfg = ImagePolicyConfig::default();
        let meta = ModelMetadata {
            hf_model_id: Some("mistralai/Mistral-7B-Instruct-v0.3".to_string()),
        };
        let r = resolve(
            &cfg,
            ImageQuery {
                model_metadata: Some(&meta),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.source, ImageSource::HuggingFace);
        assert_eq!(r.image, "ghcr.io/huggingface/text-generation-inference:2.4.0");
    }

    #[test]
    fn missing_binding_falls_back_to_default_with_warning() {
        let mut cfg = ImagePolicyConfig::default();
        cfg.table.clear();
        let spec = gpu_spec();
        let r = resolve(
            &cfg,
            ImageQuery {
                spec: Some(&spec),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.source, ImageSource::Default);
        assert_eq!(r.image, "registry.internal/serving/default-runtime:latest");
        assert_eq!(r.warnings.len(), 1);
        assert!(r.warnings[0].contains("GENERATION:gpu"));

        cfg.default_image = None;
        let err = resolve(
            &cfg,
            ImageQuery {
                spec: Some(&spec),
                use_gpu: true,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(
            err,
            PolicyError::NoImage {
                key: "GENERATION:gpu".to_string()
            }
        );
    }

    #[test]
    fn requested_quantities_beat_profile() {
        let cfg = ImagePolicyConfig::default();
        let requested = ResourceQuantities {
            memory_limit: Some("64Gi".to_string()),
            ..Default::default()
        };
        let r = resolve(
            &cfg,
            ImageQuery {
                use_gpu: true,
                requested: Some(&requested),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(r.resources.memory_limit.as_deref(), Some("64Gi"));
        assert_eq!(r.resources.cpu_request.as_deref(), Some("4"));
    }
}
