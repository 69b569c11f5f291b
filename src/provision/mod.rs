//! Credential provisioning on an endpoint server
//!
//! `KeyProvisioner` drives the xray config store, the xray process and the
//! credential ledger through the issue/revoke protocol. The HTTP surface
//! lives in `server::agent`.

mod error;
pub mod identity;
pub mod ledger;
pub mod link;
mod service;

pub use error::ProvisionError;
pub use identity::{CredentialIdentity, IdentityGenerator, RandomIdentity};
pub use ledger::{
    CredentialLedger, LedgerError, ManagedCredential, NewCredential, SqliteCredentialLedger,
};
pub use link::LinkBuilder;
pub use service::{CredentialView, IssuedCredential, KeyProvisioner};

#[cfg(test)]
#[path = "service_test.rs"]
mod service_tests;
