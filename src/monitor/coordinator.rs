//! Single owner of the health registry
//!
//! Both probe loops send their observations here; the coordinator applies
//! them in arrival order, decides on the alert cooldown, spawns every
//! broadcast and publishes a fresh snapshot after every change. Nothing here
//! waits on a notification delivery.

use super::notify::{alert_message, broadcast, recovery_message, Notifier, RecipientDirectory};
use super::registry::{alert_due, Effect, HealthRegistry, HealthSnapshot, ProbeSource};
use crate::clock::Clock;
use crate::fleet::{AlertLog, Server, ServerDirectory};
use crate::server::{SharedMetrics, ShutdownSignal};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Input of the coordinator
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Observed {
        server: Server,
        source: ProbeSource,
        healthy: bool,
    },
    /// A down-set member is gone from the server directory
    Vanished(i64),
}

/// Collaborators of the monitor
#[derive(Clone)]
pub struct MonitorDeps {
    pub servers: Arc<dyn ServerDirectory>,
    pub alerts: Arc<dyn AlertLog>,
    pub notifier: Arc<dyn Notifier>,
    pub recipients: Arc<dyn RecipientDirectory>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<SharedMetrics>,
}

/// A spawned broadcast that has finished
#[derive(Debug, Clone, Copy)]
enum Delivered {
    Alert(i64),
    Recovery(i64),
}

pub struct Coordinator {
    registry: HealthRegistry,
    deps: MonitorDeps,
    cooldown: chrono::Duration,
    snapshot_tx: watch::Sender<HealthSnapshot>,
    delivered_tx: mpsc::UnboundedSender<Delivered>,
    delivered_rx: mpsc::UnboundedReceiver<Delivered>,
}

impl Coordinator {
    pub fn new(deps: MonitorDeps, cooldown: std::time::Duration) -> (Self, watch::Receiver<HealthSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(HealthSnapshot::default());
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let cooldown = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX);
        (
            Self {
                registry: HealthRegistry::new(),
                deps,
                cooldown,
                snapshot_tx,
                delivered_tx,
                delivered_rx,
            },
            snapshot_rx,
        )
    }

    /// Process events until shutdown or until every sender is gone
    pub async fn run(mut self, mut events: mpsc::Receiver<MonitorEvent>, mut shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                Some(done) = self.delivered_rx.recv() => self.finish(done),
                _ = shutdown.wait() => break,
            }
        }
        debug!(reason = shutdown.reason().unwrap_or("probe loops gone"), "health coordinator stopped");
    }

    pub async fn handle(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Observed {
                server,
                source,
                healthy,
            } => match self.registry.apply(server.id, source, healthy) {
                Effect::CheckAlert => {
                    // Down-set change is visible before the cooldown lookup
                    self.publish();
                    self.start_alert(server).await;
                }
                Effect::NotifyRecovery => self.start_recovery(server),
                Effect::None => {}
            },
            MonitorEvent::Vanished(server_id) => {
                info!(server_id, "server removed from directory, dropping from down-set");
                self.registry.forget(server_id);
            }
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(metrics) = &self.deps.metrics {
            metrics.set_servers_down(self.registry.down_count());
        }
        self.snapshot_tx.send_replace(self.registry.snapshot());
    }

    fn finish(&mut self, done: Delivered) {
        match done {
            Delivered::Alert(server_id) => self.registry.finish_alert(server_id),
            Delivered::Recovery(server_id) => self.registry.finish_recovery(server_id),
        }
    }

    /// Decide on the cooldown here, deliver in a spawned task
    async fn start_alert(&mut self, server: Server) {
        if self.registry.alert_in_flight(server.id) {
            debug!(server = %server.name, "outage alert already in flight");
            return;
        }

        let now = self.deps.clock.now();
        let last = match self.deps.alerts.last_alert_at(server.id).await {
            Ok(last) => last,
            Err(e) => {
                error!(server = %server.name, error = %e, "failed to read last alert time, alert skipped");
                return;
            }
        };
        if !alert_due(last, now, self.cooldown) {
            info!(server = %server.name, "server down, alert skipped (cooldown)");
            if let Some(metrics) = &self.deps.metrics {
                metrics.record_alert(false);
            }
            return;
        }

        self.registry.begin_alert(server.id);
        let server_id = server.id;
        self.spawn_delivery(notify_outage(self.deps.clone(), server), Delivered::Alert(server_id));
    }

    fn start_recovery(&mut self, server: Server) {
        if !self.registry.begin_recovery(server.id) {
            debug!(server = %server.name, "recovery notification already in flight");
            return;
        }

        let server_id = server.id;
        self.spawn_delivery(
            notify_recovery(self.deps.clone(), server),
            Delivered::Recovery(server_id),
        );
    }

    fn spawn_delivery<F>(&self, delivery: F, done: Delivered)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let delivered = self.delivered_tx.clone();
        tokio::spawn(async move {
            // The marker is cleared even if the broadcast task panics
            if let Err(e) = tokio::spawn(delivery).await {
                error!(?done, error = %e, "notification task failed");
            }
            let _ = delivered.send(done);
        });
    }

    /// Wait until every spawned broadcast has finished
    #[cfg(test)]
    pub async fn settle(&mut self) {
        while self.registry.alerts_in_flight() + self.registry.recoveries_in_flight() > 0 {
            if let Some(done) = self.delivered_rx.recv().await {
                self.finish(done);
            }
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }
}

async fn notify_outage(deps: MonitorDeps, server: Server) {
    let recipients = match deps.recipients.recipients().await {
        Ok(r) => r,
        Err(e) => {
            error!(server = %server.name, error = %e, "failed to load recipients, alert skipped");
            return;
        }
    };
    if recipients.is_empty() {
        warn!(server = %server.name, "server down but nobody to notify");
        return;
    }

    let others: Vec<Server> = match deps.servers.list_servers().await {
        Ok(all) => all.into_iter().filter(|s| s.id != server.id).collect(),
        Err(e) => {
            warn!(error = %e, "failed to list alternative servers");
            Vec::new()
        }
    };

    let report = broadcast(
        deps.notifier.as_ref(),
        &recipients,
        &alert_message(&server, &others),
    )
    .await;

    if let Err(e) = deps.alerts.record_alert(server.id, deps.clock.now()).await {
        error!(server = %server.name, error = %e, "failed to record alert time");
    }
    if let Some(metrics) = &deps.metrics {
        metrics.record_alert(true);
        metrics.record_notification_failures(report.failed.len());
    }
    warn!(
        server = %server.name,
        delivered = report.delivered,
        failed = report.failed.len(),
        "server down, alert sent"
    );
}

async fn notify_recovery(deps: MonitorDeps, server: Server) {
    let recipients = match deps.recipients.recipients().await {
        Ok(r) => r,
        Err(e) => {
            error!(server = %server.name, error = %e, "failed to load recipients for recovery");
            return;
        }
    };

    let report = broadcast(deps.notifier.as_ref(), &recipients, &recovery_message(&server)).await;
    if let Some(metrics) = &deps.metrics {
        metrics.record_recovery();
        metrics.record_notification_failures(report.failed.len());
    }
    info!(
        server = %server.name,
        delivered = report.delivered,
        failed = report.failed.len(),
        "server recovered, notification sent"
    );
}
