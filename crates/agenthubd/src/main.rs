use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use agenthubd::config::Config;
use agenthubd::state::AppState;
use agenthubd::{lifecycle, outbox};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Fatal error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Fail-closed at boot: missing secrets refuse to start.
    let config = Config::from_env()?;
    tracing::info!(
        addr = %config.listen_addr,
        access_mode = config.access_mode.as_str(),
        "Starting AgentHub control plane"
    );

    let state = AppState::new(config.clone())?;

    // Background workers: stalled-delegation reaper and outbox dispatcher.
    lifecycle::spawn_reaper(state.lifecycle.clone());
    outbox::spawn_dispatcher(state.hub.clone());

    // Resume anything that stalled before the last shutdown.
    let reclaimed = state.lifecycle.reap_stale().await?;
    if reclaimed > 0 {
        tracing::info!(reclaimed, "resumed stalled delegations from previous run");
    }

    let app = agenthubd::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Received shutdown signal");
}
