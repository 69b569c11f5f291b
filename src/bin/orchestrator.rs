use anyhow::Context;
use keyfleet::clock::SystemClock;
use keyfleet::config::OrchestratorConfig;
use keyfleet::fleet::{seed_servers, HttpProvisioningClient, KeyOrchestrator, SqliteFleetStore};
use keyfleet::monitor::{
    notifier_from_config, HealthMonitor, HttpLivenessProbe, MonitorDeps, StaticRecipients,
};
use keyfleet::server::{
    create_metrics, orchestrator_router, shutdown_channel, wait_for_signal, BearerToken,
    OrchestratorState, ReadinessState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting keyfleet orchestrator");

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().context("failed to create metrics registry")?;

    let store = Arc::new(
        SqliteFleetStore::open(&config.database_path)
            .await
            .with_context(|| format!("failed to open database {}", config.database_path))?,
    );
    info!(path = %config.database_path, "Fleet database opened");

    match &config.servers_file {
        Some(path) => {
            seed_servers(store.as_ref(), path).await?;
        }
        None => info!("No servers file configured, using servers already in the database"),
    }

    let clock = Arc::new(SystemClock);
    let keys = KeyOrchestrator::new(
        store.clone(),
        store.clone(),
        Arc::new(HttpProvisioningClient::new()),
        clock.clone(),
        config.key_quota,
        config.strict_quota,
    );
    info!(
        quota = config.key_quota,
        strict = config.strict_quota,
        "Key quota configured"
    );

    if config.notify.recipients.is_empty() {
        warn!("No notification recipients configured, outage alerts will not be sent");
    }
    let deps = MonitorDeps {
        servers: store.clone(),
        alerts: store.clone(),
        notifier: notifier_from_config(&config.notify),
        recipients: Arc::new(StaticRecipients::new(config.notify.recipients.clone())),
        clock,
        metrics: Some(metrics.clone()),
    };
    let probe = Arc::new(HttpLivenessProbe::new(config.monitor.probe_timeout));
    let monitor = HealthMonitor::new(config.monitor.clone(), deps, probe).spawn(shutdown_signal.clone());

    let app = orchestrator_router(
        OrchestratorState::new(
            Arc::new(keys),
            store.clone(),
            monitor.snapshot(),
            config.admin_ids.clone(),
        ),
        BearerToken::new(config.api_token.clone()),
        readiness.clone(),
        metrics,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(port = %config.listen_port, "Orchestrator API listening");

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal.cancelled())
            .await
    });
    readiness.set_ready();

    let stopped_early = tokio::select! {
        result = &mut server => {
            error!("Orchestrator API stopped unexpectedly");
            shutdown_controller.shutdown_because("api stopped");
            Some(result)
        }
        signal = wait_for_signal() => {
            let signal = signal.context("failed to install signal handlers")?;
            readiness.set_not_ready();
            shutdown_controller.shutdown_because(signal);
            None
        }
    };

    let served = match stopped_early {
        Some(result) => result,
        None => server.await,
    };
    monitor.join().await;
    served??;

    info!("keyfleet orchestrator shut down gracefully");
    Ok(())
}
