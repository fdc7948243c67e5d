//! HTTP-level tests: requests go through the full router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use kubemanager_api::{USER_ID_HEADER, build_router};
use kubemanager_cluster::{ClusterOp, InMemoryCluster, InMemoryHelm};
use kubemanager_core::KubeManagerConfig;
use kubemanager_provision::{ProvisionSettings, Provisioner};
use kubemanager_state::StateStore;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

fn test_router() -> (Router, Arc<InMemoryCluster>) {
    let store = StateStore::open_in_memory().unwrap();
    store.seed_default_roles().unwrap();
    let cluster = Arc::new(InMemoryCluster::new());
    let mut config = KubeManagerConfig::default();
    config.saga.initial_interval_ms = 1;
    let provisioner = Provisioner::new(
        store,
        cluster.clone(),
        Arc::new(InMemoryHelm::new()),
        ProvisionSettings::from_config(&config),
    );
    (build_router(provisioner), cluster)
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header(USER_ID_HEADER, Uuid::new_v4().to_string())
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Poll a saga until it reaches a terminal status.
async fn wait_for_saga(router: &Router, saga_id: &str) -> String {
    for _ in 0..200 {
        let (status, body) = send(router, get(&format!("/api/v1/sagas/{saga_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let saga_status = body["data"]["status"].as_str().unwrap().to_string();
        if saga_status != "RUNNING" && saga_status != "COMPENSATING" {
            return saga_status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("saga {saga_id} did not finish");
}

async fn create_project(router: &Router, body: Value) -> (String, String) {
    let (status, body) = send(router, json_request("POST", "/api/v1/projects", &body)).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    (
        body["data"]["saga_id"].as_str().unwrap().to_string(),
        body["data"]["resource_id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn healthz_ok() {
    let (router, _) = test_router();
    let (status, body) = send(&router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn create_project_and_poll_status() {
    let (router, _) = test_router();
    let (saga_id, project_id) = create_project(&router, json!({ "name": "p1" })).await;

    assert_eq!(wait_for_saga(&router, &saga_id).await, "SUCCEEDED");

    let (status, body) = send(&router, get(&format!("/api/v1/projects/{project_id}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "READY");
    assert_eq!(body["data"]["phase"], "PROVISIONING_DONE");
    assert_eq!(body["data"]["namespace"]["name"], "km-p1");

    let (status, body) = send(&router, get("/api/v1/projects")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn create_project_requires_user_header() {
    let (router, _) = test_router();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/projects")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "name": "p1" }).to_string()))
        .unwrap();
    let (status, body) = send(&router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn failed_provisioning_leaves_no_project() {
    let (router, cluster) = test_router();
    cluster.fail_always(ClusterOp::CreateNamespace);

    let (saga_id, project_id) = create_project(&router, json!({ "name": "p2" })).await;
    assert_eq!(wait_for_saga(&router, &saga_id).await, "FAILED_COMPENSATED");

    let (status, _) = send(&router, get(&format!("/api/v1/projects/{project_id}/status"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&router, get(&format!("/api/v1/sagas/{saga_id}"))).await;
    assert_eq!(body["data"]["failed_step"], "create_namespace");
    assert!(body["data"].get("context").is_none());
}

#[tokio::test]
async fn quota_exceeded_is_unprocessable() {
    let (router, _) = test_router();
    let (saga_id, project_id) =
        create_project(&router, json!({ "name": "p1", "cpu_limit": "1000m" })).await;
    wait_for_saga(&router, &saga_id).await;

    let (status, body) = send(
        &router,
        json_request(
            "POST",
            "/api/v1/workloads",
            &json!({
                "project_id": project_id,
                "name": "w1",
                "image": "nginx:1.21",
                "cpu_limit": "1000m",
                "replicas": 2,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("2000m"), "{error}");
    assert!(error.contains("1000m"), "{error}");
}

#[tokio::test]
async fn workload_lifecycle() {
    let (router, _) = test_router();
    let (saga_id, project_id) = create_project(&router, json!({ "name": "p1" })).await;
    wait_for_saga(&router, &saga_id).await;

    let (status, body) = send(
        &router,
        json_request(
            "POST",
            "/api/v1/workloads",
            &json!({ "project_id": project_id, "name": "web", "image": "nginx" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let workload_id = body["data"]["resource_id"].as_str().unwrap().to_string();
    let saga_id = body["data"]["saga_id"].as_str().unwrap().to_string();
    assert_eq!(wait_for_saga(&router, &saga_id).await, "SUCCEEDED");

    let (_, body) = send(&router, get(&format!("/api/v1/workloads/{workload_id}"))).await;
    assert_eq!(body["data"]["status"], "RUNNING");
    assert_eq!(body["data"]["current_phase"], "DEPLOYED");

    let (status, body) = send(
        &router,
        json_request(
            "PATCH",
            &format!("/api/v1/workloads/{workload_id}"),
            &json!({ "replicas": 2 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let saga_id = body["data"]["saga_id"].as_str().unwrap().to_string();
    assert_eq!(wait_for_saga(&router, &saga_id).await, "SUCCEEDED");

    let (_, body) = send(&router, get(&format!("/api/v1/projects/{project_id}/workloads"))).await;
    assert_eq!(body["data"][0]["replicas"], 2);

    let (status, body) = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/workloads/{workload_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let saga_id = body["data"]["saga_id"].as_str().unwrap().to_string();
    assert_eq!(wait_for_saga(&router, &saga_id).await, "SUCCEEDED");

    let (status, _) = send(&router, get(&format!("/api/v1/workloads/{workload_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_saga_is_not_found() {
    let (router, _) = test_router();
    let (status, _) = send(&router, get("/api/v1/sagas/project.create-missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/sagas/project.create-missing/cancel")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
