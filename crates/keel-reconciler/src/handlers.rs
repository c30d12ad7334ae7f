use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use keel_common::{DeployRequest, EndpointFilter, Envelope, RedeployOverrides, ServingEndpoint};

use crate::engine::{EndpointView, LifecycleOutcome};
use crate::error::ReconcileError;
use crate::metrics::{healthz_handler, metrics_handler};
use crate::state::AppState;

impl ReconcileError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReconcileError::ValidationRejected(_)
            | ReconcileError::ImagePolicy(_)
            | ReconcileError::UnknownFramework(_) => StatusCode::BAD_REQUEST,
            ReconcileError::NotFound(_) => StatusCode::NOT_FOUND,
            ReconcileError::InvalidTransition { .. } | ReconcileError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            ReconcileError::Store(keel_meta::StoreError::Conflict(_)) => StatusCode::CONFLICT,
            ReconcileError::Store(keel_meta::StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ReconcileError::PermanentCluster(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::TransientCluster(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReconcileError::ConsistencyGuardViolation { .. }
            | ReconcileError::Store(_)
            | ReconcileError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ReconcileError {
    fn into_response(self) -> Response {
        let body: Envelope<()> = Envelope::fail(format!("{}: {}", self.code(), self));
        (self.status_code(), Json(body)).into_response()
    }
}

fn ok<T: Serialize>(status: StatusCode, message: &str, data: T) -> Response {
    (status, Json(Envelope::success(message, data))).into_response()
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/endpoints", post(deploy).get(list))
        .route("/endpoints/:id", get(get_endpoint).delete(delete))
        .route("/endpoints/:id/redeploy", post(redeploy))
        .route("/endpoints/:id/rollback", post(rollback))
        .with_state(state.clone());

    let ops = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state.engine.metrics().clone());

    Router::new()
        .nest("/api", api)
        .merge(ops)
        .route("/healthz", get(healthz_handler))
}

pub async fn deploy(
    State(st): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<Response, ReconcileError> {
    let out: LifecycleOutcome = st.engine.deploy(req).await?;
    let message = if out.warnings.is_empty() {
        "endpoint deployed".to_string()
    } else {
        out.warnings.join("; ")
    };
    Ok(ok(StatusCode::CREATED, &message, out))
}

pub async fn list(
    State(st): State<AppState>,
    Query(filter): Query<EndpointFilter>,
) -> Result<Response, ReconcileError> {
    let endpoints: Vec<ServingEndpoint> = st.engine.list(&filter).await?;
    Ok(ok(StatusCode::OK, "ok", endpoints))
}

pub async fn get_endpoint(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ReconcileError> {
    let view: EndpointView = st.engine.get(&id).await?;
    Ok(ok(StatusCode::OK, "ok", view))
}

pub async fn redeploy(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(overrides): Json<RedeployOverrides>,
) -> Result<Response, ReconcileError> {
    let out = st.engine.redeploy(&id, overrides).await?;
    Ok(ok(StatusCode::OK, "endpoint redeployed", out))
}

pub async fn rollback(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ReconcileError> {
    let out = st.engine.rollback(&id).await?;
    Ok(ok(StatusCode::OK, "endpoint rolled back", out))
}

pub async fn delete(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ReconcileError> {
    st.engine.delete(&id).await?;
    Ok(ok(StatusCode::OK, "endpoint deleted", serde_json::json!({ "id": id })))
}
