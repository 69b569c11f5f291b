//! Access to the proxy running on this endpoint server
//!
//! - `config_store`: the xray JSON configuration document (with a one-generation
//!   backup written before every overwrite)
//! - `process`: restart/status of the xray service through systemd

pub mod config_store;
pub mod process;

pub use config_store::{
    add_short_id, find_reality_inbound, remove_short_id, short_ids, ConfigStoreError,
    FileConfigStore, RuntimeConfigStore,
};
pub use process::{ProcessController, ProcessError, ProcessStatus, ServiceState, SystemdController};

#[cfg(test)]
#[path = "config_store_test.rs"]
mod config_store_tests;
