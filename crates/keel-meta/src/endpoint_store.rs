use async_trait::async_trait;
use thiserror::Error;

use keel_common::{EndpointFilter, ServingDeployment, ServingEndpoint};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("endpoint {0} not found")]
    NotFound(String),

    /// Duplicate id/route on insert, or a stale revision on commit.
    #[error("store conflict: {0}")]
    Conflict(String),

    #[error("corrupt record {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        StoreError::Backend(format!("{e:#}"))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// What a commit does to the endpoint's deployment row.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentWrite {
    Keep,
    Put(ServingDeployment),
    Remove,
}

/// Persistence boundary for endpoints and their deployment rows.
///
/// Writes are transactional: an endpoint row and its deployment row change
/// together or not at all.
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// Create a new endpoint. Fails with `Conflict` if the id or the route is taken.
    async fn insert(&self, endpoint: &ServingEndpoint) -> Result<ServingEndpoint, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<ServingEndpoint>, StoreError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<ServingDeployment>, StoreError>;

    async fn list(&self, filter: &EndpointFilter) -> Result<Vec<ServingEndpoint>, StoreError>;

    /// Replace the endpoint row if its stored revision still equals
    /// `endpoint.revision`, and apply `deployment` in the same transaction.
    /// Returns the endpoint as stored, with its revision bumped.
    async fn commit(
        &self,
        endpoint: &ServingEndpoint,
        deployment: DeploymentWrite,
    ) -> Result<ServingEndpoint, StoreError>;

    /// Delete the endpoint, its deployment row and its route reservation.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
}
