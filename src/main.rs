use std::sync::Arc;

use clap::Parser;
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lock_cache::{
    config::{BackoffConfig, ServerConfig},
    server::{ServerLockCache, Standalone},
    transport::tcp::{serve, ServerEndpoint, TcpConnector},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = ServerLockCache::new(
        Arc::new(TcpConnector),
        Arc::new(Standalone),
        BackoffConfig::default(),
    );

    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!("Listening on tcp://{}", listener.local_addr()?);

    serve(
        listener,
        Arc::new(ServerEndpoint(server.clone())),
        create_shutdown_signal(),
    )
    .await?;

    server.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
