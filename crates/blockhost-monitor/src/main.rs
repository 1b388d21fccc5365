//! Sidecar that runs one Minecraft server inside a pod and exposes its
//! console to the control plane.

use std::sync::Arc;

use blockhost_runner::jar::JarApiChain;
use tracing_subscriber::prelude::*;

mod config;
mod host;
mod routes;

use config::MonitorConfig;
use host::ServerHost;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MonitorConfig::from_env()?;
    let listen = config.listen;
    let version = config.version.clone();
    let fetcher = Arc::new(JarApiChain::from_env()?);
    let host = Arc::new(ServerHost::new(config, fetcher));

    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listen, %version, "blockhost-monitor listening");
    axum::serve(listener, routes::router(host.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down; stopping server");
    host.shutdown().await;
    Ok(())
}
