//! Calls from the orchestrator to the provisioning agents
//!
//! Production code uses `HttpProvisioningClient`. Tests use
//! `MockProvisioningClient`, which records calls and can be told to fail.

use super::Server;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Timeout of one remote provisioning call
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("agent unreachable: {0}")]
    Transport(String),

    /// Non-2xx response; `message` is the body's `error` or `message` field
    #[error("agent returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("agent returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Credential as returned by an agent's `POST /generate-key`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedKey {
    pub key_id: i64,
    pub vless_link: String,
    pub key_name: String,
    pub uuid: String,
    pub short_id: String,
}

/// Remote half of the provisioning protocol
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn issue(&self, server: &Server, owner: &str) -> Result<IssuedKey, ClientError>;

    async fn revoke(&self, server: &Server, key_id: i64) -> Result<(), ClientError>;
}

/// reqwest-based client with bearer auth
pub struct HttpProvisioningClient {
    client: reqwest::Client,
}

impl Default for HttpProvisioningClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueRequest<'a> {
    user_id: &'a str,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpProvisioningClient {
    pub fn new() -> Self {
        Self::with_timeout(REMOTE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build provisioning HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self { client }
    }

    fn endpoint(server: &Server, path: &str) -> String {
        format!("{}{}", server.api_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let message = parsed
            .error
            .or(parsed.message)
            .unwrap_or_else(|| body.chars().take(200).collect());
        Err(ClientError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn issue(&self, server: &Server, owner: &str) -> Result<IssuedKey, ClientError> {
        let request = self
            .client
            .post(Self::endpoint(server, "/generate-key"))
            .bearer_auth(&server.api_token)
            .json(&IssueRequest { user_id: owner });

        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn revoke(&self, server: &Server, key_id: i64) -> Result<(), ClientError> {
        let request = self
            .client
            .delete(Self::endpoint(server, &format!("/reject-key/{}", key_id)))
            .bearer_auth(&server.api_token);

        self.send(request).await?;
        Ok(())
    }
}

/// Mock provisioning client for testing
#[cfg(test)]
pub struct MockProvisioningClient {
    next_key_id: std::sync::atomic::AtomicI64,
    issued: std::sync::Mutex<Vec<(i64, String)>>,
    revoked: std::sync::Mutex<Vec<(i64, i64)>>,
    fail_with: std::sync::Mutex<Option<u16>>,
    delay: std::sync::Mutex<Option<std::time::Duration>>,
}

#[cfg(test)]
impl Default for MockProvisioningClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockProvisioningClient {
    pub fn new() -> Self {
        Self {
            next_key_id: std::sync::atomic::AtomicI64::new(1),
            issued: std::sync::Mutex::new(Vec::new()),
            revoked: std::sync::Mutex::new(Vec::new()),
            fail_with: std::sync::Mutex::new(None),
            delay: std::sync::Mutex::new(None),
        }
    }

    /// Make every call fail with this HTTP status (None to succeed again)
    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_with.lock().unwrap() = status;
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// (server id, owner) of every successful issue
    pub fn issued(&self) -> Vec<(i64, String)> {
        self.issued.lock().unwrap().clone()
    }

    /// (server id, key id) of every successful revoke
    pub fn revoked(&self) -> Vec<(i64, i64)> {
        self.revoked.lock().unwrap().clone()
    }

    async fn pause_and_check(&self) -> Result<(), ClientError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match *self.fail_with.lock().unwrap() {
            Some(status) => Err(ClientError::Remote {
                status,
                message: "Failed to restart Xray".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl ProvisioningClient for MockProvisioningClient {
    async fn issue(&self, server: &Server, owner: &str) -> Result<IssuedKey, ClientError> {
        self.pause_and_check().await?;
        let key_id = self
            .next_key_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.issued
            .lock()
            .unwrap()
            .push((server.id, owner.to_string()));
        let key_name = format!("{}_{}", server.name, key_id);
        Ok(IssuedKey {
            key_id,
            vless_link: format!("vless://mock@{}:{}#{}", server.host, server.port, key_name),
            key_name,
            uuid: uuid::Uuid::new_v4().to_string(),
            short_id: format!("{:016x}", key_id),
        })
    }

    async fn revoke(&self, server: &Server, key_id: i64) -> Result<(), ClientError> {
        self.pause_and_check().await?;
        self.revoked.lock().unwrap().push((server.id, key_id));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::{delete, post},
        Json, Router,
    };
    use serde_json::{json, Value};

    async fn spawn_agent(router: Router) -> Server {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Server {
            id: 1,
            name: "Local".to_string(),
            host: addr.ip().to_string(),
            port: 443,
            api_token: "agent-token".to_string(),
            api_url: format!("http://{}/", addr),
        }
    }

    #[tokio::test]
    async fn test_issue_sends_bearer_and_user_id() {
        let router = Router::new().route(
            "/generate-key",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["authorization"], "Bearer agent-token");
                assert_eq!(body["userId"], "42");
                (
                    StatusCode::CREATED,
                    Json(json!({
                        "keyId": 5,
                        "vlessLink": "vless://x@h:443#Local_1",
                        "keyName": "Local_1",
                        "uuid": "u",
                        "shortId": "s"
                    })),
                )
            }),
        );
        let server = spawn_agent(router).await;

        let key = HttpProvisioningClient::new().issue(&server, "42").await.unwrap();

        assert_eq!(key.key_id, 5);
        assert_eq!(key.key_name, "Local_1");
    }

    #[tokio::test]
    async fn test_remote_error_carries_status_and_message() {
        let router = Router::new().route(
            "/reject-key/{id}",
            delete(|Path(id): Path<i64>| async move {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "Not Found", "message": format!("Key {} not found", id) })),
                )
            }),
        );
        let server = spawn_agent(router).await;

        let err = HttpProvisioningClient::new().revoke(&server, 9).await.unwrap_err();

        match err {
            ClientError::Remote { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Not Found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_field_used_when_error_missing() {
        let router = Router::new().route(
            "/generate-key",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": "Failed to restart Xray" })),
                )
            }),
        );
        let server = spawn_agent(router).await;

        let err = HttpProvisioningClient::new().issue(&server, "1").await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::Remote { status: 500, ref message } if message == "Failed to restart Xray"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let server = Server {
            id: 1,
            name: "Gone".to_string(),
            host: "127.0.0.1".to_string(),
            port: 443,
            api_token: "t".to_string(),
            api_url: format!("http://{}", addr),
        };

        let err = HttpProvisioningClient::new().issue(&server, "1").await.unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
    }
}
