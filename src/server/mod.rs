//! HTTP surfaces of both binaries
//!
//! - `agent`: provisioning API served on every endpoint server
//! - `orchestrator`: fleet API (issue/revoke through agents, server health)
//! - `health`: `/healthz`, `/readyz` and `/metrics`, merged into both routers
//! - `auth`: bearer token middleware
//!
//! Also provides graceful shutdown handling for SIGTERM/SIGINT.

pub mod agent;
mod auth;
mod error;
mod health;
pub mod metrics;
pub mod orchestrator;
pub mod shutdown;

pub use agent::{agent_router, AgentState};
pub use auth::{require_bearer, BearerToken};
pub use error::ApiError;
pub use health::{operational_router, ReadinessState};
pub use metrics::{create_metrics, FleetMetrics, SharedMetrics};
pub use orchestrator::{orchestrator_router, OrchestratorState};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

#[cfg(test)]
#[path = "agent_test.rs"]
mod agent_tests;

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_tests;
