//! Key provisioning protocol
//!
//! Issue and revoke touch three independently failing resources in a fixed
//! order: the xray config document, the xray process, then the ledger. A
//! failure stops the sequence where it happened and nothing is rolled back:
//!
//! - issue: restart failure leaves the short id in the config with no ledger
//!   row (orphan); a ledger failure after a successful restart does the same
//! - revoke: restart failure leaves the short id removed from the config
//!   while the ledger row remains
//!
//! Every issue/revoke on one agent runs inside `write_lock`, so two requests
//! never interleave their read-modify-write of the document.

use super::error::ProvisionError;
use super::identity::{IdentityGenerator, RandomIdentity};
use super::ledger::{CredentialLedger, LedgerError, ManagedCredential, NewCredential};
use super::link::LinkBuilder;
use crate::clock::Clock;
use crate::server::SharedMetrics;
use crate::xray::{
    add_short_id, remove_short_id, ProcessController, ProcessError, ProcessStatus,
    RuntimeConfigStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Result of a successful issue, as returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredential {
    pub key_id: i64,
    pub vless_link: String,
    pub key_name: String,
    pub uuid: String,
    pub short_id: String,
}

/// One ledger entry with its connection URI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialView {
    pub id: i64,
    pub key_name: String,
    pub uuid: String,
    pub short_id: String,
    pub created_at: DateTime<Utc>,
    pub vless_link: String,
}

pub struct KeyProvisioner {
    config_store: Arc<dyn RuntimeConfigStore>,
    process: Arc<dyn ProcessController>,
    ledger: Arc<dyn CredentialLedger>,
    identities: Arc<dyn IdentityGenerator>,
    links: LinkBuilder,
    server_name: String,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    metrics: Option<SharedMetrics>,
}

impl KeyProvisioner {
    pub fn new(
        config_store: Arc<dyn RuntimeConfigStore>,
        process: Arc<dyn ProcessController>,
        ledger: Arc<dyn CredentialLedger>,
        links: LinkBuilder,
        server_name: impl Into<String>,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Self {
            config_store,
            process,
            ledger,
            identities: Arc::new(RandomIdentity),
            links,
            server_name: server_name.into(),
            clock,
            write_lock: Mutex::new(()),
            metrics,
        }
    }

    /// Replace the identifier source (tests pin short ids with this)
    pub fn with_identities(mut self, identities: Arc<dyn IdentityGenerator>) -> Self {
        self.identities = identities;
        self
    }

    /// Issue a new credential for `owner_id`
    pub async fn issue(&self, owner_id: &str) -> Result<IssuedCredential, ProvisionError> {
        let result = self.issue_locked(owner_id).await;
        self.observe("issue", &result);
        result
    }

    /// Revoke credential `id`
    ///
    /// An unknown id returns `NotFound` without touching the config, the
    /// process or the ledger.
    pub async fn revoke(&self, id: i64) -> Result<(), ProvisionError> {
        let result = self.revoke_locked(id).await;
        self.observe("revoke", &result);
        result
    }

    /// Credentials of `owner_id`, ordered by id
    pub async fn list(&self, owner_id: &str) -> Result<Vec<CredentialView>, ProvisionError> {
        let owner_id = validate_owner(owner_id)?;
        let records = self.ledger.list_by_owner(owner_id).await?;
        Ok(records.into_iter().map(|r| self.view(r)).collect())
    }

    /// State and version of the xray service
    pub async fn status(&self) -> Result<ProcessStatus, ProcessError> {
        self.process.status().await
    }

    async fn issue_locked(&self, owner_id: &str) -> Result<IssuedCredential, ProvisionError> {
        let owner_id = validate_owner(owner_id)?;
        let identity = self.identities.generate();

        let _guard = self.write_lock.lock().await;

        let mut document = self.config_store.load().await?;
        add_short_id(&mut document, &identity.short_id)?;
        self.config_store.save(&document).await?;

        if let Err(e) = self.process.restart().await {
            warn!(
                owner = %owner_id,
                short_id = %identity.short_id,
                error = %e,
                "xray restart failed after config write, short id left in config without a ledger record"
            );
            return Err(e.into());
        }

        let ordinal = self.ledger.count_by_owner(owner_id).await? + 1;
        let display_name = format!("{}_{}", self.server_name, ordinal);

        let record = self
            .ledger
            .insert(NewCredential {
                owner_id: owner_id.to_string(),
                client_id: identity.client_id,
                short_id: identity.short_id,
                server_name: self.server_name.clone(),
                display_name,
                created_at: self.clock.now(),
            })
            .await
            .inspect_err(|e| {
                if let LedgerError::DuplicateShortId(short_id) = e {
                    error!(
                        owner = %owner_id,
                        short_id = %short_id,
                        "short id collision, config already carries the duplicate"
                    );
                }
            })?;

        info!(
            key_id = record.id,
            owner = %record.owner_id,
            key_name = %record.display_name,
            "credential issued"
        );

        let vless_link = self
            .links
            .build(&record.client_id, &record.short_id, &record.display_name);
        Ok(IssuedCredential {
            key_id: record.id,
            vless_link,
            key_name: record.display_name,
            uuid: record.client_id,
            short_id: record.short_id,
        })
    }

    async fn revoke_locked(&self, id: i64) -> Result<(), ProvisionError> {
        let _guard = self.write_lock.lock().await;

        let record = self
            .ledger
            .get(id)
            .await?
            .ok_or(ProvisionError::NotFound(id))?;

        let mut document = self.config_store.load().await?;
        if !remove_short_id(&mut document, &record.short_id)? {
            warn!(key_id = id, short_id = %record.short_id, "short id was already absent from config");
        }
        self.config_store.save(&document).await?;

        if let Err(e) = self.process.restart().await {
            warn!(
                key_id = id,
                error = %e,
                "xray restart failed after config write, ledger record kept"
            );
            return Err(e.into());
        }

        self.ledger.delete(id).await?;
        info!(key_id = id, owner = %record.owner_id, "credential revoked");
        Ok(())
    }

    fn view(&self, record: ManagedCredential) -> CredentialView {
        let vless_link = self
            .links
            .build(&record.client_id, &record.short_id, &record.display_name);
        CredentialView {
            id: record.id,
            key_name: record.display_name,
            uuid: record.client_id,
            short_id: record.short_id,
            created_at: record.created_at,
            vless_link,
        }
    }

    fn observe<T>(&self, operation: &str, result: &Result<T, ProvisionError>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match result {
            Ok(_) if operation == "issue" => metrics.record_issued(),
            Ok(_) => metrics.record_revoked(),
            Err(e) => metrics.record_provisioning_error(operation, e.kind()),
        }
    }
}

/// Blank ids are rejected; anything else is stored exactly as given
fn validate_owner(owner_id: &str) -> Result<&str, ProvisionError> {
    if owner_id.trim().is_empty() {
        return Err(ProvisionError::Validation("userId is required".to_string()));
    }
    Ok(owner_id)
}
