//! Unrelated MCP Aggregator
//!
//! Aggregate stdio MCP servers behind one SSE + streamable HTTP endpoint.

use clap::Parser;
use std::io::{IsTerminal as _, stdout};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use unrelated_mcp_aggregator::{CliArgs, Gateway, GatewayConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Configuration errors are fatal before anything starts.
    let config = GatewayConfig::load(cli)?;

    if config.cli.print_effective_config {
        let yaml = serde_yaml::to_string(&config.effective())?;
        print!("{yaml}");
        return Ok(());
    }

    init_logging(&config.settings.log_level);

    tracing::info!("Starting Unrelated MCP Aggregator v{}", VERSION);
    tracing::info!("Loaded {} server(s) from config", config.servers.len());

    let addr: SocketAddr = config.settings.bind.parse().map_err(|e| {
        anyhow::anyhow!("Invalid bind address '{}': {}", config.settings.bind, e)
    })?;

    let gateway = Arc::new(Gateway::new(config.settings.clone(), config.servers));
    let summary = gateway.start().await;
    tracing::info!(
        connected = summary.connected.len(),
        failed = summary.failed.len(),
        "backends connected"
    );

    let app = gateway.router();
    tracing::info!("Starting HTTP server (SSE + streamable HTTP) on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let ct = gateway.shutdown_token();
    let server_ct = ct.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_ct.cancelled().await;
        });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    shutdown_signal(&ct).await;
    gateway.shutdown().await;
    if let Err(e) = server.await {
        tracing::error!(error = %e, "http server task failed");
    }

    tracing::info!("Aggregator shut down gracefully");
    Ok(())
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for Ctrl+C or SIGTERM, or for the gateway to be shut down some other way.
async fn shutdown_signal(ct: &CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
        () = ct.cancelled() => {}
    }
}
