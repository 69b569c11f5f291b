use super::ledger::LedgerError;
use crate::xray::{ConfigStoreError, ProcessError};
use thiserror::Error;

/// Failure of an issue/revoke/list operation on the agent
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{0}")]
    Validation(String),

    /// The document has no VLESS inbound with a client list
    #[error("VLESS inbound not found in xray config")]
    ConfigNotFound,

    #[error("xray config error: {0}")]
    ConfigStore(ConfigStoreError),

    #[error("failed to restart xray: {0}")]
    Restart(#[from] ProcessError),

    #[error("key {0} not found")]
    NotFound(i64),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl ProvisionError {
    /// Short label used for the provisioning error metric
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "validation",
            ProvisionError::ConfigNotFound => "config_not_found",
            ProvisionError::ConfigStore(_) => "config_store",
            ProvisionError::Restart(_) => "restart",
            ProvisionError::NotFound(_) => "not_found",
            ProvisionError::Ledger(_) => "ledger",
        }
    }
}

impl From<ConfigStoreError> for ProvisionError {
    fn from(err: ConfigStoreError) -> Self {
        match err {
            ConfigStoreError::InboundNotFound => ProvisionError::ConfigNotFound,
            other => ProvisionError::ConfigStore(other),
        }
    }
}
