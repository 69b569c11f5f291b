//! Prometheus metrics shared by the agent and the orchestrator
//!
//! Each binary owns one registry. Components that record metrics take an
//! `Option<SharedMetrics>` so tests can run without one.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters and gauges for credential provisioning and fleet health
pub struct FleetMetrics {
    registry: Registry,
    credentials_issued: IntCounter,
    credentials_revoked: IntCounter,
    provisioning_errors: IntCounterVec,
    probes: IntCounterVec,
    alerts_sent: IntCounter,
    alerts_suppressed: IntCounter,
    recoveries: IntCounter,
    notification_failures: IntCounter,
    servers_down: IntGauge,
}

pub type SharedMetrics = Arc<FleetMetrics>;

/// Create a registry with every keyfleet metric registered
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    let registry = Registry::new();

    let credentials_issued = IntCounter::new(
        "keyfleet_credentials_issued_total",
        "Credentials issued successfully",
    )?;
    let credentials_revoked = IntCounter::new(
        "keyfleet_credentials_revoked_total",
        "Credentials revoked successfully",
    )?;
    let provisioning_errors = IntCounterVec::new(
        Opts::new(
            "keyfleet_provisioning_errors_total",
            "Failed issue/revoke operations by operation and error kind",
        ),
        &["operation", "kind"],
    )?;
    let probes = IntCounterVec::new(
        Opts::new("keyfleet_probes_total", "Liveness probes by result"),
        &["result"],
    )?;
    let alerts_sent = IntCounter::new("keyfleet_alerts_sent_total", "Outage alerts broadcast")?;
    let alerts_suppressed = IntCounter::new(
        "keyfleet_alerts_suppressed_total",
        "Outage alerts skipped because of the cooldown window",
    )?;
    let recoveries = IntCounter::new(
        "keyfleet_recoveries_total",
        "Recovery notifications broadcast",
    )?;
    let notification_failures = IntCounter::new(
        "keyfleet_notification_failures_total",
        "Per-recipient notification deliveries that failed",
    )?;
    let servers_down = IntGauge::new("keyfleet_servers_down", "Servers currently in the down-set")?;

    registry.register(Box::new(credentials_issued.clone()))?;
    registry.register(Box::new(credentials_revoked.clone()))?;
    registry.register(Box::new(provisioning_errors.clone()))?;
    registry.register(Box::new(probes.clone()))?;
    registry.register(Box::new(alerts_sent.clone()))?;
    registry.register(Box::new(alerts_suppressed.clone()))?;
    registry.register(Box::new(recoveries.clone()))?;
    registry.register(Box::new(notification_failures.clone()))?;
    registry.register(Box::new(servers_down.clone()))?;

    Ok(Arc::new(FleetMetrics {
        registry,
        credentials_issued,
        credentials_revoked,
        provisioning_errors,
        probes,
        alerts_sent,
        alerts_suppressed,
        recoveries,
        notification_failures,
        servers_down,
    }))
}

impl FleetMetrics {
    pub fn record_issued(&self) {
        self.credentials_issued.inc();
    }

    pub fn record_revoked(&self) {
        self.credentials_revoked.inc();
    }

    /// `operation` is "issue" or "revoke"; `kind` a short error category
    pub fn record_provisioning_error(&self, operation: &str, kind: &str) {
        self.provisioning_errors
            .with_label_values(&[operation, kind])
            .inc();
    }

    pub fn record_probe(&self, healthy: bool) {
        let result = if healthy { "healthy" } else { "unhealthy" };
        self.probes.with_label_values(&[result]).inc();
    }

    pub fn record_alert(&self, sent: bool) {
        if sent {
            self.alerts_sent.inc();
        } else {
            self.alerts_suppressed.inc();
        }
    }

    pub fn record_recovery(&self) {
        self.recoveries.inc();
    }

    pub fn record_notification_failures(&self, failed: usize) {
        self.notification_failures.inc_by(failed as u64);
    }

    pub fn set_servers_down(&self, count: usize) {
        self.servers_down.set(count as i64);
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
