//! Tests for the orchestrator fleet API

use super::agent_tests::agent_with;
use super::*;
use crate::clock::SystemClock;
use crate::fleet::client::MockProvisioningClient;
use crate::fleet::{
    HttpProvisioningClient, KeyOrchestrator, MirrorLedger, NewServer, ProvisioningClient,
    ServerDirectory, SqliteFleetStore,
};
use crate::monitor::{HealthSnapshot, HealthStatus};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceExt;

const TOKEN: &str = "fleet-secret";
const ADMIN: &str = "1000";

struct Harness {
    router: axum::Router,
    store: Arc<SqliteFleetStore>,
    client: Arc<MockProvisioningClient>,
    health: watch::Sender<HealthSnapshot>,
    server_id: i64,
}

async fn add_server(store: &SqliteFleetStore, name: &str, api_url: &str, api_token: &str) -> i64 {
    store
        .upsert_server(NewServer {
            name: name.to_string(),
            host: format!("{}.vpn.example.net", name.to_lowercase()),
            port: 443,
            api_token: api_token.to_string(),
            api_url: api_url.to_string(),
        })
        .await
        .unwrap()
        .id
}

fn router_for(
    store: Arc<SqliteFleetStore>,
    client: Arc<dyn ProvisioningClient>,
    health: watch::Receiver<HealthSnapshot>,
) -> axum::Router {
    let keys = KeyOrchestrator::new(
        store.clone(),
        store.clone(),
        client,
        Arc::new(SystemClock),
        2,
        false,
    );
    orchestrator_router(
        OrchestratorState::new(Arc::new(keys), store, health, vec![ADMIN.to_string()]),
        BearerToken::new(TOKEN),
        ReadinessState::new(),
        create_metrics().unwrap(),
    )
}

async fn harness() -> Harness {
    let store = Arc::new(SqliteFleetStore::in_memory().await.unwrap());
    let server_id = add_server(&store, "Warsaw", "http://warsaw.invalid:3000", "agent").await;
    let client = Arc::new(MockProvisioningClient::new());
    let (health, health_rx) = watch::channel(HealthSnapshot::default());
    let router = router_for(store.clone(), client.clone(), health_rx);

    Harness {
        router,
        store,
        client,
        health,
        server_id,
    }
}

fn request(method: &str, uri: &str, requester: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", TOKEN));
    if let Some(requester) = requester {
        builder = builder.header("x-requester-id", requester);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn issue(h: &Harness, owner: &str) -> (StatusCode, Value) {
    send(
        &h.router,
        request(
            "POST",
            &format!("/servers/{}/keys", h.server_id),
            None,
            Some(json!({ "owner": owner })),
        ),
    )
    .await
}

#[tokio::test]
async fn test_fleet_api_requires_bearer_token() {
    let h = harness().await;
    let unauthenticated = Request::builder()
        .uri("/servers")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&h.router, unauthenticated).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_request_issue_creates_mirror_record() {
    let h = harness().await;

    let (status, body) = issue(&h, "42").await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["owner"], "42");
    assert_eq!(body["server_id"], h.server_id);
    assert_eq!(body["key_name"], "Warsaw_1");
    assert_eq!(h.store.count_for("42", h.server_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_request_issue_maps_failures() {
    let h = harness().await;

    let (status, _) = send(
        &h.router,
        request("POST", "/servers/abc/keys", None, Some(json!({ "owner": "42" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &h.router,
        request(
            "POST",
            &format!("/servers/{}/keys", h.server_id),
            None,
            Some(json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &h.router,
        request("POST", "/servers/999/keys", None, Some(json!({ "owner": "42" }))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Server not found");

    h.client.fail_with(Some(500));
    let (status, body) = issue(&h, "42").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["message"].as_str().unwrap().contains("Failed to restart Xray"));
    assert_eq!(h.store.count_for("42", h.server_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_quota_exceeded_is_conflict() {
    let h = harness().await;

    assert_eq!(issue(&h, "42").await.0, StatusCode::CREATED);
    assert_eq!(issue(&h, "42").await.0, StatusCode::CREATED);
    let (status, body) = issue(&h, "42").await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Key limit reached");
    assert_eq!(h.client.issued().len(), 2);
}

#[tokio::test]
async fn test_request_revoke_checks_requester() {
    let h = harness().await;
    let (_, first) = issue(&h, "42").await;
    let (_, second) = issue(&h, "42").await;
    let first_id = first["id"].as_i64().unwrap();
    let second_id = second["id"].as_i64().unwrap();

    let path = format!("/keys/{}", first_id);
    let (status, _) = send(&h.router, request("DELETE", &path, None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.router, request("DELETE", &path, Some("7"), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(h.store.get_mirror(first_id).await.unwrap().is_some());
    assert!(h.client.revoked().is_empty());

    let (status, _) = send(&h.router, request("DELETE", &path, Some("42"), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &h.router,
        request("DELETE", &format!("/keys/{}", second_id), Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&h.router, request("DELETE", &path, Some("42"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(h.client.revoked().len(), 2);
}

#[tokio::test]
async fn test_keys_lists_owner_records() {
    let h = harness().await;
    issue(&h, "42").await;
    issue(&h, "7").await;

    let (status, body) = send(&h.router, request("GET", "/keys?owner=42", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner"], "42");
    assert_eq!(body["keys"].as_array().unwrap().len(), 1);

    let (status, _) = send(&h.router, request("GET", "/keys", None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_servers_report_monitor_health() {
    let h = harness().await;
    let down_id = add_server(&h.store, "Oslo", "http://oslo.invalid:3000", "agent").await;
    let unprobed_id = add_server(&h.store, "Zurich", "http://zurich.invalid:3000", "agent").await;

    let mut snapshot = HealthSnapshot::default();
    snapshot.statuses.insert(h.server_id, HealthStatus::Up);
    snapshot.statuses.insert(down_id, HealthStatus::Down);
    snapshot.down.insert(down_id);
    h.health.send_replace(snapshot);

    let (status, body) = send(&h.router, request("GET", "/servers", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            { "id": down_id, "name": "Oslo", "address": "oslo.vpn.example.net", "port": 443, "health": "down" },
            { "id": h.server_id, "name": "Warsaw", "address": "warsaw.vpn.example.net", "port": 443, "health": "up" },
            { "id": unprobed_id, "name": "Zurich", "address": "zurich.vpn.example.net", "port": 443 },
        ])
    );
    for view in body.as_array().unwrap() {
        if let Some(health) = view.get("health") {
            assert!(*health == "up" || *health == "down");
        }
    }
}

/// Issue through a real agent whose config has no usable inbound
#[tokio::test]
async fn test_agent_config_error_surfaces_as_bad_gateway() {
    let agent = agent_with(
        json!({ "inbounds": [{ "protocol": "trojan", "settings": { "clients": [] } }] }),
        "agent-token",
    )
    .await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let agent_router = agent.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, agent_router).await.unwrap();
    });

    let store = Arc::new(SqliteFleetStore::in_memory().await.unwrap());
    let server_id = add_server(&store, "Vilnius", &format!("http://{}", addr), "agent-token").await;
    let (_health, health_rx) = watch::channel(HealthSnapshot::default());
    let router = router_for(store.clone(), Arc::new(HttpProvisioningClient::new()), health_rx);

    let (status, body) = send(
        &router,
        request(
            "POST",
            &format!("/servers/{}/keys", server_id),
            None,
            Some(json!({ "owner": "42" })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["message"].as_str().unwrap().contains("500"));
    assert_eq!(store.count_for("42", server_id).await.unwrap(), 0);
    assert_eq!(agent.process.restarts(), 0);
    assert_eq!(agent.store.saves(), 0);
}
