//! keyfleet: VPN credential provisioning and fleet health monitoring
//!
//! Two binaries share this library:
//! - `keyfleet` (the agent) runs on every endpoint server and issues/revokes
//!   reality credentials by editing the local xray configuration
//! - `keyfleet-orchestrator` keeps a mirror of issued credentials, enforces
//!   per-(owner, server) quotas and watches fleet health

pub mod clock;
pub mod config;
pub mod fleet;
pub mod monitor;
pub mod provision;
pub mod server;
pub mod xray;
