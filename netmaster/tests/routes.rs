mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use libresource::{FakeStateDriver, StateResourceManager};
use netmaster::daemon::proxy::follower_router;
use netmaster::daemon::routes::leader_router;
use netmaster::daemon::{DaemonState, MasterDaemon};
use netmaster::master::{AddressAllocResponse, NetMaster};
use netmaster::objdb::{FakeLock, FakeServiceRegistry};
use serde_json::{Value, json};
use serial_test::serial;
use tower::ServiceExt;

use common::{init_logging, local_config};

async fn daemon_state(lock: Arc<FakeLock>) -> Arc<DaemonState> {
    let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
    let master = Arc::new(NetMaster::new(Arc::new(rm)));
    let daemon = MasterDaemon::new(
        local_config(),
        master,
        lock,
        Arc::new(FakeServiceRegistry::new()),
    )
    .await
    .unwrap();
    Arc::clone(daemon.state())
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, String) {
    let req = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(v) => req
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
#[serial]
async fn leader_serves_version_and_info() {
    init_logging();
    let lock = Arc::new(FakeLock::new("10.0.0.1:9999"));
    let app = leader_router(daemon_state(lock.clone()).await);

    let (status, body) = call(&app, Method::GET, "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["version"], env!("CARGO_PKG_VERSION"));

    let (status, body) = call(&app, Method::GET, "/info", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.contains("Leader not found"));

    lock.set_holder(Some("10.0.0.1:9999")).await;
    let (status, body) = call(&app, Method::GET, "/info", None).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["leader-ip"], "10.0.0.1:9999");
    assert_eq!(v["local-ip"], "127.0.0.1");
    assert_eq!(v["current-state"], "follower");
}

#[tokio::test]
#[serial]
async fn model_objects_and_address_allocation() {
    init_logging();
    let lock = Arc::new(FakeLock::new("10.0.0.1:9999"));
    let app = leader_router(daemon_state(lock).await);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/tenants",
        Some(json!({ "tenantName": "t1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::GET, "/networks", None).await;
    assert_eq!(status, StatusCode::OK);
    let nets: Vec<Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(nets.len(), 2);

    let (status, body) = call(&app, Method::GET, "/networks/privateNet.t1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"subnetIP\":\"10.1.0.0\""));

    let (status, body) = call(
        &app,
        Method::POST,
        "/plugin/allocAddress",
        Some(json!({ "NetworkID": "privateNet.t1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let resp: AddressAllocResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(resp.ipv4_address, "10.1.0.1/16");

    let (status, body) = call(
        &app,
        Method::POST,
        "/plugin/allocAddress",
        Some(json!({ "NetworkID": "nope.t1" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.is_empty());

    let (status, body) = call(&app, Method::DELETE, "/api/v1/tenants/t1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT, "{body}");
    let (_, body) = call(&app, Method::GET, "/api/v1/tenants", None).await;
    assert_eq!(body, "[]");
}

#[tokio::test]
#[serial]
async fn follower_reports_missing_or_self_leader() {
    init_logging();
    let lock = Arc::new(FakeLock::new("10.0.0.1:9999"));
    let app = follower_router(daemon_state(lock.clone()).await);

    let (status, body) = call(&app, Method::GET, "/networks", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Leader not found");

    lock.set_holder(Some("10.0.0.1:9999")).await;
    let (status, body) = call(&app, Method::GET, "/networks", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Self proxying error");
}
