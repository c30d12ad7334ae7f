pub mod adapter;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod image_policy;
pub mod locks;
pub mod metrics;
pub mod retry;
pub mod state;
pub mod validator;

pub use engine::{EndpointView, LifecycleOutcome, ReconciliationEngine};
pub use error::ReconcileError;
