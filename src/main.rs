use anyhow::Context;
use keyfleet::clock::SystemClock;
use keyfleet::config::AgentConfig;
use keyfleet::provision::{KeyProvisioner, LinkBuilder, SqliteCredentialLedger};
use keyfleet::server::{
    agent_router, create_metrics, shutdown_channel, wait_for_signal, AgentState, BearerToken,
    ReadinessState,
};
use keyfleet::xray::{FileConfigStore, SystemdController};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting keyfleet provisioning agent");

    let config = AgentConfig::from_env().context("invalid agent configuration")?;

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().context("failed to create metrics registry")?;

    let ledger = SqliteCredentialLedger::open(&config.ledger_path)
        .await
        .with_context(|| format!("failed to open ledger {}", config.ledger_path))?;
    info!(path = %config.ledger_path, "Credential ledger opened");

    let links = LinkBuilder::new(&config.reality).context("invalid reality parameters")?;
    let provisioner = KeyProvisioner::new(
        Arc::new(FileConfigStore::new(&config.xray_config_path)),
        Arc::new(SystemdController::new(&config.xray_unit, &config.xray_binary)),
        Arc::new(ledger),
        links,
        config.server_name.clone(),
        Arc::new(SystemClock),
        Some(metrics.clone()),
    );

    let app = agent_router(
        AgentState::new(Arc::new(provisioner)),
        BearerToken::new(config.token.clone()),
        readiness.clone(),
        metrics,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        port = %config.listen_port,
        server = %config.server_name,
        xray_config = %config.xray_config_path.display(),
        "Provisioning API listening"
    );

    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal.cancelled())
            .await
    });
    readiness.set_ready();

    let reason = tokio::select! {
        result = &mut server => {
            error!("Provisioning API stopped unexpectedly");
            result??;
            return Ok(());
        }
        signal = wait_for_signal() => signal.context("failed to install signal handlers")?,
    };
    readiness.set_not_ready();
    shutdown_controller.shutdown_because(reason);
    server.await??;

    info!("keyfleet agent shut down gracefully");
    Ok(())
}
