use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Training job that produced the model being served.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Sft,
    RagTuning,
    Rlhf,
    Pretrain,
    Embedding,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Sft,
        JobType::RagTuning,
        JobType::Rlhf,
        JobType::Pretrain,
        JobType::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Sft => "SFT",
            JobType::RagTuning => "RAG_TUNING",
            JobType::Rlhf => "RLHF",
            JobType::Pretrain => "PRETRAIN",
            JobType::Embedding => "EMBEDDING",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|j| j.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of inference surface the endpoint exposes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServeTarget {
    Generation,
    Rag,
}

impl ServeTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServeTarget::Generation => "GENERATION",
            ServeTarget::Rag => "RAG",
        }
    }

    /// RAG is reserved for RAG_TUNING models; every other job serves GENERATION.
    pub fn accepts(&self, job_type: JobType) -> bool {
        match self {
            ServeTarget::Rag => job_type == JobType::RagTuning,
            ServeTarget::Generation => job_type != JobType::RagTuning,
        }
    }
}

impl FromStr for ServeTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GENERATION" => Ok(ServeTarget::Generation),
            "RAG" => Ok(ServeTarget::Rag),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ServeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SpecResources {
    /// Signed so that negative values survive deserialisation and can be rejected.
    #[serde(default)]
    pub gpus: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_gb: Option<f64>,
}

/// Runtime limits. All three are mandatory and must be positive; they are
/// optional here only so that a missing field is reported as a rejection
/// instead of a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RuntimeLimits {
    #[serde(default)]
    pub max_concurrent_requests: Option<i64>,
    #[serde(default)]
    pub max_input_tokens: Option<i64>,
    #[serde(default)]
    pub max_output_tokens: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RolloutStrategy {
    BlueGreen,
    Canary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficSplit {
    pub old: u32,
    pub new: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rollout {
    pub strategy: RolloutStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_split: Option<TrafficSplit>,
}

/// Whitelisted description of how a trained model should be served.
///
/// Treated as an immutable value: a redeploy replaces the whole spec rather
/// than editing fields. `model_family`, `job_type` and `serve_target` stay
/// strings on the wire so that unknown values reach the validator and are
/// rejected there with a reason, rather than failing request decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSpec {
    pub model_ref: String,
    pub model_family: String,
    pub job_type: String,
    pub serve_target: String,

    #[serde(default)]
    pub resources: SpecResources,

    #[serde(default)]
    pub runtime: RuntimeLimits,

    #[serde(default)]
    pub use_gpu: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

impl DeploymentSpec {
    pub fn parsed_job_type(&self) -> Option<JobType> {
        self.job_type.parse().ok()
    }

    pub fn parsed_serve_target(&self) -> Option<ServeTarget> {
        self.serve_target.parse().ok()
    }
}
