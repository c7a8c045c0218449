//! sync-server: applies authenticated file transfers under one directory.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sync_core::Credential;
use sync_server::{AppState, router};

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Receive mirrored files from sync-daemon clients")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8888, env = "SYNC_PORT")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "SYNC_BIND")]
    bind: String,

    /// Directory that receives the mirrored files
    #[arg(long, default_value = ".", env = "SYNC_DIRECTORY")]
    directory: PathBuf,

    /// Shared secret clients must present
    #[arg(long, env = "SYNC_CREDENTIAL", hide_env_values = true)]
    credential: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let credential = Credential::new(cli.credential);
    if credential.is_empty() {
        anyhow::bail!("Credential must not be empty");
    }

    let state = AppState::new(&cli.directory, &credential)
        .with_context(|| format!("Cannot serve {}", cli.directory.display()))?;
    let root = state.store.root().to_path_buf();
    let app = router(Arc::new(state));

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .context("Invalid bind address")?;

    tracing::info!("Starting sync-server on {}", addr);
    tracing::info!("Destination directory: {}", root.display());

    // Start server
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Sync server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}
