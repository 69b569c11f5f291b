//! Liveness probes against agent `/health-check` endpoints

use crate::fleet::Server;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Why the server counts as down (status, timeout, transport error)
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, server: &Server) -> ProbeOutcome;
}

#[derive(Deserialize)]
struct HealthBody {
    status: Option<String>,
}

/// `GET {api_url}/health-check`, healthy iff 2xx with `status == "active"`
pub struct HttpLivenessProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build probe HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self { client, timeout }
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn probe(&self, server: &Server) -> ProbeOutcome {
        let url = format!("{}/health-check", server.api_url.trim_end_matches('/'));
        let response = match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return ProbeOutcome::Unhealthy(format!("timed out after {:?}", self.timeout))
            }
            Err(e) => return ProbeOutcome::Unhealthy(format!("unreachable: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Unhealthy(format!("HTTP {}", status.as_u16()));
        }

        match response.json::<HealthBody>().await {
            Ok(HealthBody {
                status: Some(state),
            }) if state == "active" => ProbeOutcome::Healthy,
            Ok(HealthBody { status }) => ProbeOutcome::Unhealthy(format!(
                "xray status {}",
                status.as_deref().unwrap_or("missing")
            )),
            Err(e) if e.is_timeout() => {
                ProbeOutcome::Unhealthy(format!("timed out after {:?}", self.timeout))
            }
            Err(e) => ProbeOutcome::Unhealthy(format!("invalid body: {}", e)),
        }
    }
}

/// Probe whose answer per server id is set by the test
#[cfg(test)]
pub struct ScriptedProbe {
    healthy: std::sync::Mutex<std::collections::HashMap<i64, bool>>,
    calls: std::sync::Mutex<Vec<i64>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl ScriptedProbe {
    pub fn new() -> Self {
        Self {
            healthy: std::sync::Mutex::new(std::collections::HashMap::new()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Unscripted servers probe as healthy
    pub fn set(&self, server_id: i64, healthy: bool) {
        self.healthy.lock().unwrap().insert(server_id, healthy);
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, server: &Server) -> ProbeOutcome {
        self.calls.lock().unwrap().push(server.id);
        let healthy = *self.healthy.lock().unwrap().get(&server.id).unwrap_or(&true);
        if healthy {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Unhealthy("xray status inactive".to_string())
        }
    }
}
