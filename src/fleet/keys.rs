//! Quota-checked issue and ownership-checked revoke, mirrored locally
//!
//! A mirror record is written only after the agent confirmed the issue, and
//! deleted only after the agent confirmed the revoke. Without `strict_quota`
//! the quota check and the remote call are not serialized: two concurrent
//! requests for the same (owner, server) can both pass the check.

use super::client::{ClientError, ProvisioningClient};
use super::store::StoreError;
use super::{MirrorLedger, MirrorRecord, NewMirrorRecord, ServerDirectory};
use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Validation(String),

    #[error("server {0} not found")]
    ServerNotFound(i64),

    #[error("key limit of {limit} reached for this server")]
    QuotaExceeded { limit: usize },

    #[error("key {0} not found")]
    NotFound(i64),

    #[error("requester does not own this key")]
    Forbidden,

    #[error(transparent)]
    Remote(#[from] ClientError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("quota lock poisoned")]
    LockPoisoned,
}

/// Per-(owner, server) async locks; entries nobody holds are pruned
#[derive(Default)]
struct QuotaLocks {
    locks: Mutex<HashMap<(String, i64), Arc<tokio::sync::Mutex<()>>>>,
}

impl QuotaLocks {
    fn lock_for(&self, owner: &str, server_id: i64) -> Result<Arc<tokio::sync::Mutex<()>>, OrchestratorError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| OrchestratorError::LockPoisoned)?;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks
            .entry((owner.to_string(), server_id))
            .or_default()
            .clone())
    }
}

pub struct KeyOrchestrator {
    servers: Arc<dyn ServerDirectory>,
    mirrors: Arc<dyn MirrorLedger>,
    client: Arc<dyn ProvisioningClient>,
    clock: Arc<dyn Clock>,
    quota: usize,
    strict_locks: Option<QuotaLocks>,
}

impl KeyOrchestrator {
    pub fn new(
        servers: Arc<dyn ServerDirectory>,
        mirrors: Arc<dyn MirrorLedger>,
        client: Arc<dyn ProvisioningClient>,
        clock: Arc<dyn Clock>,
        quota: usize,
        strict_quota: bool,
    ) -> Self {
        Self {
            servers,
            mirrors,
            client,
            clock,
            quota,
            strict_locks: strict_quota.then(QuotaLocks::default),
        }
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Issue a credential for `owner` on server `server_id`
    pub async fn request_issue(
        &self,
        owner: &str,
        server_id: i64,
    ) -> Result<MirrorRecord, OrchestratorError> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(OrchestratorError::Validation("owner is required".to_string()));
        }

        let server = self
            .servers
            .get_server(server_id)
            .await?
            .ok_or(OrchestratorError::ServerNotFound(server_id))?;

        let lock = match &self.strict_locks {
            Some(locks) => Some(locks.lock_for(owner, server_id)?),
            None => None,
        };
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let count = self.mirrors.count_for(owner, server_id).await?;
        if count >= self.quota as u64 {
            info!(owner = %owner, server = %server.name, count, "key quota reached");
            return Err(OrchestratorError::QuotaExceeded { limit: self.quota });
        }

        let issued = self.client.issue(&server, owner).await.inspect_err(|e| {
            warn!(owner = %owner, server = %server.name, error = %e, "remote issue failed");
        })?;

        let record = self
            .mirrors
            .insert_mirror(NewMirrorRecord {
                key_id: issued.key_id,
                owner: owner.to_string(),
                server_id,
                client_id: issued.uuid,
                short_id: issued.short_id,
                key_name: issued.key_name,
                link: issued.vless_link,
                created_at: self.clock.now(),
            })
            .await
            .inspect_err(|e| {
                error!(
                    owner = %owner,
                    server = %server.name,
                    remote_key_id = issued.key_id,
                    error = %e,
                    "credential issued remotely but not mirrored"
                );
            })?;

        info!(
            id = record.id,
            remote_key_id = record.key_id,
            owner = %owner,
            server = %server.name,
            "credential issued"
        );
        Ok(record)
    }

    /// Revoke mirror record `id` on behalf of `requester`
    ///
    /// Only the owner or a privileged requester may revoke. The mirror record
    /// is kept when the agent call fails.
    pub async fn request_revoke(
        &self,
        id: i64,
        requester: &str,
        privileged: bool,
    ) -> Result<(), OrchestratorError> {
        let record = self
            .mirrors
            .get_mirror(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))?;

        if record.owner != requester && !privileged {
            warn!(id, requester = %requester, "revoke refused, requester is not the owner");
            return Err(OrchestratorError::Forbidden);
        }

        let server = self
            .servers
            .get_server(record.server_id)
            .await?
            .ok_or(OrchestratorError::ServerNotFound(record.server_id))?;

        self.client
            .revoke(&server, record.key_id)
            .await
            .inspect_err(|e| {
                warn!(id, server = %server.name, error = %e, "remote revoke failed, mirror record kept");
            })?;

        self.mirrors.delete_mirror(id).await?;
        info!(id, owner = %record.owner, server = %server.name, "credential revoked");
        Ok(())
    }

    /// Mirror records of `owner`, ordered by id
    pub async fn keys_of(&self, owner: &str) -> Result<Vec<MirrorRecord>, OrchestratorError> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(OrchestratorError::Validation("owner is required".to_string()));
        }
        Ok(self.mirrors.mirrors_of(owner).await?)
    }
}
