mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use keel_reconciler::adapter::AdapterError;
use keel_reconciler::handlers::router;
use keel_reconciler::state::AppState;

use common::{deploy_request, harness, Harness};

fn app(h: &Harness) -> Router {
    router(AppState {
        engine: h.engine.clone(),
    })
}

async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn deploy_then_get_returns_envelopes() {
    let h = harness();
    let body = serde_json::to_value(deploy_request("ep-1", "/v1/ep-1")).unwrap();

    let (status, v) = call(app(&h), "POST", "/api/endpoints", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v["status"], "success");
    assert_eq!(v["data"]["endpoint"]["status"], "healthy");

    let (status, v) = call(app(&h), "GET", "/api/endpoints/ep-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["endpoint"]["route"], "/v1/ep-1");
    assert!(v["data"]["deployment"].is_object());

    let (status, v) = call(app(&h), "GET", "/api/endpoints?status=healthy", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn validation_failure_is_a_bad_request() {
    let h = harness();
    let mut body = serde_json::to_value(deploy_request("ep-1", "/v1/ep-1")).unwrap();
    body["deployment_spec"]["model_family"] = json!("unknown-arch");

    let (status, v) = call(app(&h), "POST", "/api/endpoints", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["status"], "fail");
    assert!(v["data"].is_null());
    assert!(v["message"].as_str().unwrap().contains("model_family"));
}

#[tokio::test]
async fn unknown_endpoint_is_not_found() {
    let h = harness();
    let (status, v) = call(app(&h), "GET", "/api/endpoints/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["status"], "fail");

    let (status, _) = call(app(&h), "POST", "/api/endpoints/nope/rollback", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn redeploy_accepts_partial_overrides() {
    let h = harness();
    h.engine.deploy(deploy_request("ep-1", "/v1/ep-1")).await.unwrap();

    let (status, v) = call(
        app(&h),
        "POST",
        "/api/endpoints/ep-1/redeploy",
        Some(json!({ "runtime_image": "img:b", "use_gpu": null })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["data"]["endpoint"]["runtime_image"], "img:b");
    assert_eq!(v["data"]["endpoint"]["use_gpu"], true);
}

#[tokio::test]
async fn unconfirmed_delete_is_a_server_error() {
    let h = harness();
    h.engine.deploy(deploy_request("ep-1", "/v1/ep-1")).await.unwrap();
    h.adapter
        .fail_delete(AdapterError::Transient("timeout".into()), 10);

    let (status, v) = call(app(&h), "DELETE", "/api/endpoints/ep-1", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(v["message"]
        .as_str()
        .unwrap()
        .starts_with("consistency_guard_violation"));

    let (status, _) = call(app(&h), "GET", "/api/endpoints/ep-1", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn healthz_and_metrics_are_served() {
    let h = harness();
    h.engine.deploy(deploy_request("ep-1", "/v1/ep-1")).await.unwrap();

    let resp = app(&h)
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app(&h)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("keel_reconciler_lifecycle_total{op=\"deploy\"} 1\n"));
}
