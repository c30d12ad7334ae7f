pub mod config;
pub mod deployment_spec;
pub mod endpoint;
pub mod endpoint_request;
pub mod envelope;
pub mod serving_deployment;

pub use config::{ConfigError, PlatformConfig};
pub use deployment_spec::{
    DeploymentSpec, JobType, Rollout, RolloutStrategy, RuntimeLimits, ServeTarget, SpecResources,
    TrafficSplit,
};
pub use endpoint::{
    AutoscalePolicy, EndpointStatus, Environment, ResourceQuantities, RollbackPlan,
    ServingEndpoint,
};
pub use endpoint_request::{
    DeployRequest, EndpointFilter, ModelMetadata, Override, RedeployOverrides,
};
pub use envelope::{Envelope, EnvelopeStatus};
pub use serving_deployment::{ResourceRef, ServingDeployment};

pub mod telemetry;
