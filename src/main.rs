pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ports;
pub mod supervisor;

use tracing_subscriber::EnvFilter;

use crate::gateway::HubContext;
use crate::ports::{find_free_port, FREE_PORT_ATTEMPTS};

/// Probe start for the gateway socket when no port is configured.
const GATEWAY_PORT_START: u16 = 8000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcphubd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting mcphubd");

    let config = config::load_config();
    let bind = config.server.bind.clone();
    let port = match config.server.port {
        Some(port) => port,
        None => find_free_port(GATEWAY_PORT_START, FREE_PORT_ATTEMPTS)?,
    };
    let bind_addr = format!("{}:{}", bind, port);

    let ctx = HubContext::new(config);

    // Boot-time launch group, when configured: start the set and log the
    // credential that scopes to whatever actually came up.
    let autostart = ctx.config.launch.autostart.clone();
    if !autostart.is_empty() {
        let specs = config::load_server_specs(&ctx.config.paths.servers_config);
        let outcome = ctx
            .registry
            .launch_group(&ctx.store, &specs, &autostart)
            .await?;
        match &outcome.token {
            Some(token) => {
                ctx.audit
                    .log(
                        "credential.issue",
                        &audit::token_prefix(token),
                        "issued",
                        &format!("servers: {}", outcome.started.join(", ")),
                    )
                    .await;
                tracing::info!(
                    "Autostarted [{}]; API key: {}",
                    outcome.started.join(", "),
                    token
                );
            }
            None => {
                tracing::warn!("Autostart launched nothing; no API key issued");
            }
        }
    }

    let app = gateway::router(ctx.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("mcphubd gateway listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down; stopping all servers");
    ctx.registry.stop_all().await;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!("SIGTERM handler unavailable: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
