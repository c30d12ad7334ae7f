use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use keel_common::{EndpointFilter, ServingDeployment, ServingEndpoint};

use crate::endpoint_store::{DeploymentWrite, EndpointStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS serving_endpoints (
        id             TEXT PRIMARY KEY,
        route          TEXT NOT NULL UNIQUE,
        environment    TEXT NOT NULL,
        model_entry_id TEXT NOT NULL,
        status         TEXT NOT NULL,
        revision       BIGINT NOT NULL,
        record         TEXT NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS serving_deployments (
        endpoint_id TEXT PRIMARY KEY REFERENCES serving_endpoints(id) ON DELETE CASCADE,
        record      TEXT NOT NULL
    )"#,
];

const LIST_QUERY: &str = "SELECT id, record FROM serving_endpoints \
     WHERE ($1::text IS NULL OR environment = $1) \
       AND ($2::text IS NULL OR model_entry_id = $2) \
       AND ($3::text IS NULL OR status = $3) \
     ORDER BY created_at, id";

/// `EndpointStore` backed by PostgreSQL.
///
/// The full record is kept as JSON in `record`; the indexed columns mirror the
/// fields used for filtering and uniqueness.
#[derive(Clone)]
pub struct PgEndpointStore {
    pool: PgPool,
}

impl PgEndpointStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, record: &str) -> Result<T, StoreError> {
    serde_json::from_str(record).map_err(|source| {
        tracing::warn!(key=%key, error=%source, "corrupt row in postgres store");
        StoreError::Corrupt {
            key: key.to_string(),
            source,
        }
    })
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

/// Text binds for the `list` query, in `$1..$3` order. `None` matches any.
fn filter_binds(filter: &EndpointFilter) -> [Option<&str>; 3] {
    [
        filter.environment.map(|e| e.as_str()),
        filter.model_id.as_deref(),
        filter.status.map(|s| s.as_str()),
    ]
}

/// Error for a guarded UPDATE that touched no row.
fn missed_update(id: &str, exists: bool) -> StoreError {
    if exists {
        tracing::debug!(endpoint_id=%id, "stale revision rejected");
        StoreError::Conflict(format!("endpoint {id} changed concurrently"))
    } else {
        StoreError::NotFound(id.to_string())
    }
}

#[async_trait]
impl EndpointStore for PgEndpointStore {
    async fn insert(&self, endpoint: &ServingEndpoint) -> Result<ServingEndpoint, StoreError> {
        let mut stored = endpoint.clone();
        stored.revision = 1;
        let record = encode(&stored.id, &stored)?;

        sqlx::query(
            "INSERT INTO serving_endpoints \
             (id, route, environment, model_entry_id, status, revision, record, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&stored.id)
        .bind(&stored.route)
        .bind(stored.environment.as_str())
        .bind(&stored.model_entry_id)
        .bind(stored.status.as_str())
        .bind(stored.revision as i64)
        .bind(record)
        .bind(stored.created_at)
        .execute(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<ServingEndpoint>, StoreError> {
        let row = sqlx::query("SELECT record FROM serving_endpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(decode(id, row.try_get::<&str, _>("record")?)?)),
            None => Ok(None),
        }
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<ServingDeployment>, StoreError> {
        let row = sqlx::query("SELECT record FROM serving_deployments WHERE endpoint_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(decode(id, row.try_get::<&str, _>("record")?)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &EndpointFilter) -> Result<Vec<ServingEndpoint>, StoreError> {
        let [environment, model_id, status] = filter_binds(filter);
        let rows = sqlx::query(LIST_QUERY)
            .bind(environment)
            .bind(model_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: &str = row.try_get("id")?;
                let record: &str = row.try_get("record")?;
                decode(id, record)
            })
            .collect()
    }

    async fn commit(
        &self,
        endpoint: &ServingEndpoint,
        deployment: DeploymentWrite,
    ) -> Result<ServingEndpoint, StoreError> {
        let mut stored = endpoint.clone();
        stored.revision = endpoint.revision + 1;
        let record = encode(&stored.id, &stored)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE serving_endpoints \
             SET status = $1, revision = $2, record = $3 \
             WHERE id = $4 AND revision = $5 AND route = $6",
        )
        .bind(stored.status.as_str())
        .bind(stored.revision as i64)
        .bind(record)
        .bind(&stored.id)
        .bind(endpoint.revision as i64)
        .bind(&stored.route)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let exists = sqlx::query("SELECT 1 FROM serving_endpoints WHERE id = $1")
                .bind(&stored.id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();
            return Err(missed_update(&stored.id, exists));
        }

        match deployment {
            DeploymentWrite::Keep => {}
            DeploymentWrite::Put(dep) => {
                let dep_record = encode(&stored.id, &dep)?;
                sqlx::query(
                    "INSERT INTO serving_deployments (endpoint_id, record) VALUES ($1, $2) \
                     ON CONFLICT (endpoint_id) DO UPDATE SET record = EXCLUDED.record",
                )
                .bind(&stored.id)
                .bind(dep_record)
                .execute(&mut *tx)
                .await?;
            }
            DeploymentWrite::Remove => {
                sqlx::query("DELETE FROM serving_deployments WHERE endpoint_id = $1")
                    .bind(&stored.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM serving_deployments WHERE endpoint_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM serving_endpoints WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }
}
