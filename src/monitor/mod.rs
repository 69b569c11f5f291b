//! Dual-rate health monitor for the endpoint fleet
//!
//! Three tasks cooperate:
//! - main loop: probes every known server each `check_interval` (first
//!   cycle runs immediately)
//! - rapid loop: probes only down-set members each `rapid_interval`
//! - coordinator: owns the `HealthRegistry`, receives every observation over
//!   an mpsc channel, sends alerts and recovery notifications
//!
//! The rapid loop and the HTTP API read the down-set and statuses from the
//! coordinator's `watch` snapshot; nothing else mutates monitor state.

pub mod coordinator;
pub mod notify;
pub mod probe;
pub mod registry;

pub use coordinator::{Coordinator, MonitorDeps, MonitorEvent};
pub use notify::{
    broadcast, notifier_from_config, BroadcastReport, LogNotifier, NotifyError, Notifier,
    RecipientDirectory, StaticRecipients, TelegramNotifier, WebhookNotifier,
};
pub use probe::{HttpLivenessProbe, LivenessProbe, ProbeOutcome};
pub use registry::{HealthRegistry, HealthSnapshot, HealthStatus, ProbeSource};

use crate::config::MonitorConfig;
use crate::fleet::ServerDirectory;
use crate::server::{SharedMetrics, ShutdownSignal};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;

pub struct HealthMonitor {
    config: MonitorConfig,
    deps: MonitorDeps,
    probe: Arc<dyn LivenessProbe>,
}

/// Running monitor tasks
pub struct MonitorHandle {
    snapshot: watch::Receiver<HealthSnapshot>,
    tasks: Vec<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn snapshot(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot.clone()
    }

    /// Wait for all monitor tasks to stop (after shutdown was signalled)
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "health monitor task failed");
            }
        }
    }
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, deps: MonitorDeps, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            config,
            deps,
            probe,
        }
    }

    /// Start the coordinator and both probe loops
    pub fn spawn(self, shutdown: ShutdownSignal) -> MonitorHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (coordinator, snapshot) = Coordinator::new(self.deps.clone(), self.config.alert_cooldown);

        info!(
            main_secs = self.config.check_interval.as_secs(),
            rapid_secs = self.config.rapid_interval.as_secs(),
            "health monitor started"
        );

        let coordinator_task = tokio::spawn(coordinator.run(events_rx, shutdown.clone()));

        let main_task = tokio::spawn(main_loop(
            self.config.check_interval,
            self.deps.servers.clone(),
            self.probe.clone(),
            events_tx.clone(),
            self.deps.metrics.clone(),
            shutdown.clone(),
        ));

        let rapid_task = tokio::spawn(rapid_loop(
            self.config.rapid_interval,
            self.deps.servers.clone(),
            self.probe,
            snapshot.clone(),
            events_tx,
            self.deps.metrics.clone(),
            shutdown,
        ));

        MonitorHandle {
            snapshot,
            tasks: vec![coordinator_task, main_task, rapid_task],
        }
    }
}

async fn main_loop(
    period: std::time::Duration,
    servers: Arc<dyn ServerDirectory>,
    probe: Arc<dyn LivenessProbe>,
    events: mpsc::Sender<MonitorEvent>,
    metrics: Option<SharedMetrics>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !run_main_cycle(servers.as_ref(), probe.as_ref(), &events, metrics.as_ref()).await {
                    break;
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    debug!("main health loop stopped");
}

async fn rapid_loop(
    period: std::time::Duration,
    servers: Arc<dyn ServerDirectory>,
    probe: Arc<dyn LivenessProbe>,
    snapshot: watch::Receiver<HealthSnapshot>,
    events: mpsc::Sender<MonitorEvent>,
    metrics: Option<SharedMetrics>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !run_rapid_cycle(servers.as_ref(), probe.as_ref(), &snapshot, &events, metrics.as_ref()).await {
                    break;
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    debug!("rapid health loop stopped");
}

/// Probe every server once; false once the coordinator is gone
pub async fn run_main_cycle(
    servers: &dyn ServerDirectory,
    probe: &dyn LivenessProbe,
    events: &mpsc::Sender<MonitorEvent>,
    metrics: Option<&SharedMetrics>,
) -> bool {
    let list = match servers.list_servers().await {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "failed to list servers for health check");
            return true;
        }
    };

    for server in list {
        let outcome = probe.probe(&server).await;
        if let Some(metrics) = metrics {
            metrics.record_probe(outcome.is_healthy());
        }
        if let ProbeOutcome::Unhealthy(reason) = &outcome {
            warn!(server = %server.name, reason = %reason, "server is DOWN");
        }
        let event = MonitorEvent::Observed {
            server,
            source: ProbeSource::Main,
            healthy: outcome.is_healthy(),
        };
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

/// Probe the current down-set once; false once the coordinator is gone
pub async fn run_rapid_cycle(
    servers: &dyn ServerDirectory,
    probe: &dyn LivenessProbe,
    snapshot: &watch::Receiver<HealthSnapshot>,
    events: &mpsc::Sender<MonitorEvent>,
    metrics: Option<&SharedMetrics>,
) -> bool {
    let down: Vec<i64> = snapshot.borrow().down.iter().copied().collect();

    for server_id in down {
        let event = match servers.get_server(server_id).await {
            Ok(Some(server)) => {
                let outcome = probe.probe(&server).await;
                if let Some(metrics) = metrics {
                    metrics.record_probe(outcome.is_healthy());
                }
                debug!(server = %server.name, ?outcome, "rapid probe");
                MonitorEvent::Observed {
                    server,
                    source: ProbeSource::Rapid,
                    healthy: outcome.is_healthy(),
                }
            }
            Ok(None) => MonitorEvent::Vanished(server_id),
            Err(e) => {
                error!(server_id, error = %e, "failed to load server for rapid check");
                continue;
            }
        };
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_tests;

#[cfg(test)]
#[path = "monitor_test.rs"]
mod monitor_tests;
