//! Tests for quota, ownership and mirroring in the key orchestrator

use super::client::MockProvisioningClient;
use super::*;
use crate::clock::SystemClock;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    orchestrator: Arc<KeyOrchestrator>,
    store: Arc<SqliteFleetStore>,
    client: Arc<MockProvisioningClient>,
    server_id: i64,
}

async fn harness(strict_quota: bool) -> Harness {
    let store = Arc::new(SqliteFleetStore::in_memory().await.unwrap());
    let server = store
        .upsert_server(NewServer {
            name: "Frankfurt".to_string(),
            host: "10.0.0.1".to_string(),
            port: 443,
            api_token: "agent-token".to_string(),
            api_url: "http://10.0.0.1:3000".to_string(),
        })
        .await
        .unwrap();
    let client = Arc::new(MockProvisioningClient::new());
    let orchestrator = KeyOrchestrator::new(
        store.clone(),
        store.clone(),
        client.clone(),
        Arc::new(SystemClock),
        2,
        strict_quota,
    );

    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        client,
        server_id: server.id,
    }
}

#[tokio::test]
async fn test_issue_mirrors_remote_result() {
    let h = harness(false).await;

    let record = h.orchestrator.request_issue("42", h.server_id).await.unwrap();

    assert_eq!(record.owner, "42");
    assert_eq!(record.server_id, h.server_id);
    assert_eq!(record.key_id, 1);
    assert_eq!(h.store.get_mirror(record.id).await.unwrap(), Some(record));
    assert_eq!(h.client.issued(), vec![(h.server_id, "42".to_string())]);
}

#[tokio::test]
async fn test_sequential_issues_stop_at_quota() {
    let h = harness(false).await;

    h.orchestrator.request_issue("42", h.server_id).await.unwrap();
    h.orchestrator.request_issue("42", h.server_id).await.unwrap();
    let err = h.orchestrator.request_issue("42", h.server_id).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::QuotaExceeded { limit: 2 }));
    // Rejected before any remote call
    assert_eq!(h.client.issued().len(), 2);
    assert_eq!(h.store.count_for("42", h.server_id).await.unwrap(), 2);

    // Another owner still has room
    h.orchestrator.request_issue("7", h.server_id).await.unwrap();
}

#[tokio::test]
async fn test_unknown_server_is_rejected_without_remote_call() {
    let h = harness(false).await;

    let err = h.orchestrator.request_issue("42", 999).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::ServerNotFound(999)));
    assert!(h.client.issued().is_empty());
}

#[tokio::test]
async fn test_remote_issue_failure_writes_nothing() {
    let h = harness(false).await;
    h.client.fail_with(Some(500));

    let err = h.orchestrator.request_issue("42", h.server_id).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Remote(ClientError::Remote { status: 500, .. })
    ));
    assert!(h.store.mirrors_of("42").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_strict_quota_blocks_concurrent_overallocation() {
    let h = harness(true).await;
    h.client.set_delay(Duration::from_millis(20));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let orchestrator = h.orchestrator.clone();
        let server_id = h.server_id;
        handles.push(tokio::spawn(async move {
            orchestrator.request_issue("42", server_id).await
        }));
    }
    let mut granted = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(OrchestratorError::QuotaExceeded { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(granted, 2);
    assert_eq!(refused, 4);
    assert_eq!(h.store.count_for("42", h.server_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_owner_can_revoke() {
    let h = harness(false).await;
    let record = h.orchestrator.request_issue("42", h.server_id).await.unwrap();

    h.orchestrator.request_revoke(record.id, "42", false).await.unwrap();

    assert!(h.store.get_mirror(record.id).await.unwrap().is_none());
    assert_eq!(h.client.revoked(), vec![(h.server_id, record.key_id)]);
}

#[tokio::test]
async fn test_stranger_revoke_is_forbidden_and_changes_nothing() {
    let h = harness(false).await;
    let record = h.orchestrator.request_issue("42", h.server_id).await.unwrap();

    let err = h
        .orchestrator
        .request_revoke(record.id, "intruder", false)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Forbidden));
    assert!(h.client.revoked().is_empty());
    assert!(h.store.get_mirror(record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_privileged_requester_can_revoke_any_key() {
    let h = harness(false).await;
    let record = h.orchestrator.request_issue("42", h.server_id).await.unwrap();

    h.orchestrator.request_revoke(record.id, "admin", true).await.unwrap();

    assert!(h.store.get_mirror(record.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_remote_revoke_keeps_mirror() {
    let h = harness(false).await;
    let record = h.orchestrator.request_issue("42", h.server_id).await.unwrap();
    h.client.fail_with(Some(500));

    let err = h
        .orchestrator
        .request_revoke(record.id, "42", false)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Remote(_)));
    assert!(h.store.get_mirror(record.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_revoke_unknown_record() {
    let h = harness(false).await;

    let err = h.orchestrator.request_revoke(404, "42", true).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::NotFound(404)));
    assert!(h.client.revoked().is_empty());
}

#[tokio::test]
async fn test_keys_of_lists_only_owner_records() {
    let h = harness(false).await;
    h.orchestrator.request_issue("42", h.server_id).await.unwrap();
    h.orchestrator.request_issue("7", h.server_id).await.unwrap();

    let keys = h.orchestrator.keys_of("42").await.unwrap();

    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].owner, "42");
    assert!(matches!(
        h.orchestrator.keys_of(" ").await,
        Err(OrchestratorError::Validation(_))
    ));
}
