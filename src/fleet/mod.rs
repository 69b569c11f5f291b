//! Orchestrator-side view of the fleet
//!
//! - `store`: SQLite server directory, mirror ledger and alert log
//! - `client`: remote calls to the provisioning agents
//! - `keys`: quota-checked issue/revoke through the agents, mirrored locally

pub mod client;
pub mod keys;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

pub use client::{ClientError, HttpProvisioningClient, IssuedKey, ProvisioningClient};
pub use keys::{KeyOrchestrator, OrchestratorError};
pub use store::{SqliteFleetStore, StoreError};

/// An endpoint server running a provisioning agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Bearer token of the agent API
    #[serde(skip_serializing)]
    pub api_token: String,
    /// Base URL of the agent API
    pub api_url: String,
}

/// Server definition as read from the servers file
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub api_token: String,
    pub api_url: String,
}

/// Orchestrator copy of a credential issued by an agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorRecord {
    pub id: i64,
    /// Credential id on the agent
    pub key_id: i64,
    pub owner: String,
    pub server_id: i64,
    pub client_id: String,
    pub short_id: String,
    pub key_name: String,
    pub link: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMirrorRecord {
    pub key_id: i64,
    pub owner: String,
    pub server_id: i64,
    pub client_id: String,
    pub short_id: String,
    pub key_name: String,
    pub link: String,
    pub created_at: DateTime<Utc>,
}

/// Known endpoint servers
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// All servers ordered by name
    async fn list_servers(&self) -> Result<Vec<Server>, StoreError>;

    async fn get_server(&self, id: i64) -> Result<Option<Server>, StoreError>;

    /// Insert, or replace every field of the server with the same name
    async fn upsert_server(&self, server: NewServer) -> Result<Server, StoreError>;
}

/// Orchestrator mirror of issued credentials
#[async_trait]
pub trait MirrorLedger: Send + Sync {
    async fn insert_mirror(&self, record: NewMirrorRecord) -> Result<MirrorRecord, StoreError>;

    async fn get_mirror(&self, id: i64) -> Result<Option<MirrorRecord>, StoreError>;

    /// Returns whether a row was deleted
    async fn delete_mirror(&self, id: i64) -> Result<bool, StoreError>;

    /// Mirror records of `owner` on one server
    async fn count_for(&self, owner: &str, server_id: i64) -> Result<u64, StoreError>;

    async fn mirrors_of(&self, owner: &str) -> Result<Vec<MirrorRecord>, StoreError>;
}

/// Persisted time of the last outage alert per server
#[async_trait]
pub trait AlertLog: Send + Sync {
    async fn last_alert_at(&self, server_id: i64) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn record_alert(&self, server_id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read servers file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid servers file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Upsert every server listed in a JSON array file, matched by name
pub async fn seed_servers(directory: &dyn ServerDirectory, path: &Path) -> Result<Vec<Server>, SeedError> {
    let shown = path.display().to_string();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SeedError::Read {
            path: shown.clone(),
            source,
        })?;
    let definitions: Vec<NewServer> =
        serde_json::from_str(&raw).map_err(|source| SeedError::Parse {
            path: shown.clone(),
            source,
        })?;

    let mut servers = Vec::with_capacity(definitions.len());
    for definition in definitions {
        servers.push(directory.upsert_server(definition).await?);
    }
    info!(path = %shown, count = servers.len(), "servers loaded");
    Ok(servers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod seed_tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_seed_upserts_by_name() {
        let store = SqliteFleetStore::in_memory().await.unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"name": "Riga", "host": "198.51.100.1", "port": 443, "api_token": "a", "api_url": "http://198.51.100.1:3000"}},
                {{"name": "Tallinn", "host": "198.51.100.2", "port": 8443, "api_token": "b", "api_url": "http://198.51.100.2:3000"}}
            ]"#
        )
        .unwrap();

        let first = seed_servers(&store, file.path()).await.unwrap();
        let again = seed_servers(&store, file.path()).await.unwrap();

        assert_eq!(first, again);
        let names: Vec<String> = store
            .list_servers()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Riga", "Tallinn"]);
    }

    #[tokio::test]
    async fn test_seed_reports_bad_files() {
        let store = SqliteFleetStore::in_memory().await.unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "Riga"}}"#).unwrap();

        let err = seed_servers(&store, file.path()).await.unwrap_err();
        assert!(matches!(err, SeedError::Parse { .. }));

        let err = seed_servers(&store, Path::new("/nonexistent/servers.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, SeedError::Read { .. }));
    }
}

#[cfg(test)]
#[path = "keys_test.rs"]
mod keys_tests;
