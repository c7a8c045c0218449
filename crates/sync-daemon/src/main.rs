//! sync-daemon: Mirrors local directories to a transfer server.
//!
//! Watches every configured root, coalesces bursts of changes per path, and
//! pushes the result over HTTP.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sync_core::{ClientConfig, Credential, EventBus, SyncRegistry, coalescer};
use sync_daemon::{RootWatcher, StatusTracker, TransferClient, dispatcher, scan_directory};

/// Capacity of the coalescer → dispatcher queue.
const ACTION_QUEUE_CAPACITY: usize = 256;

/// How long shutdown waits for in-flight transfers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// How often a transfer summary is logged, if anything changed.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Mirror local directories to a sync server")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the server URL from the config file
    #[arg(long)]
    server: Option<String>,

    /// Override the shared credential from the config file
    #[arg(long, env = "SYNC_CREDENTIAL", hide_env_values = true)]
    credential: Option<String>,

    /// Upload the existing contents of these directories
    #[arg(long, num_args = 1..)]
    dirs: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::load(&self.config)
            .with_context(|| format!("Failed to load config {}", self.config.display()))?;
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(credential) = &self.credential {
            config.credential = Credential::new(credential.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,sync_daemon=info,sync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sync-daemon");

    let config = args.load_config()?;
    let registry = Arc::new(SyncRegistry::from_config(&config)?);
    for root in registry.roots() {
        info!(
            "Root {}: {} -> /{} ({})",
            root.name(),
            root.local_path().display(),
            root.remote_path(),
            if root.is_enabled() { "enabled" } else { "disabled" }
        );
    }

    let client = Arc::new(TransferClient::from_config(&config)?);
    client
        .health_check()
        .await
        .with_context(|| format!("Server {} is not usable", client.server_url()))?;
    info!("Connected to {}", client.server_url());

    let bus = Arc::new(EventBus::new());
    let status = StatusTracker::attach(&bus);
    let (actions_tx, dispatcher_task) =
        dispatcher::spawn(Arc::clone(&client), Some(Arc::clone(&bus)), ACTION_QUEUE_CAPACITY);

    let mut coalescers = HashMap::new();
    let mut watchers = Vec::new();
    for root in registry.roots() {
        let handle = coalescer::spawn(
            Arc::clone(root),
            config.debounce(),
            Some(Arc::clone(&bus)),
            actions_tx.clone(),
        );
        watchers.push(RootWatcher::start(Arc::clone(root), handle.events.clone())?);
        coalescers.insert(root.name().to_string(), handle);
    }
    drop(actions_tx);

    // Watchers are live, so anything edited during the walk is seen too
    for dir in &args.dirs {
        let scan = scan_directory(&registry, dir).await?;
        let Some(handle) = coalescers.get(scan.root.name()) else {
            anyhow::bail!("No coalescer for root {}", scan.root.name());
        };
        scan.queue(&handle.events)?;
    }

    info!("Daemon running. Press Ctrl+C to stop.");

    let mut reload = ReloadSignal::new()?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut report = tokio::time::interval_at(tokio::time::Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            _ = report.tick() => {
                if let Some(snapshot) = status.take_changed() {
                    snapshot.log();
                }
            }

            _ = reload.recv() => {
                match args.load_config() {
                    Ok(reloaded) => {
                        let changed = registry.apply_enabled(&reloaded);
                        info!("Configuration reloaded ({} root(s) toggled)", changed.len());
                    }
                    Err(e) => error!("Failed to reload configuration: {:#}", e),
                }
            }
        }
    }

    info!("Shutting down");

    // Stop watching, then let coalescers flush and the dispatcher drain
    drop(watchers);
    let drain = async {
        for handle in coalescers.into_values() {
            drop(handle.events);
            let _ = handle.task.await;
        }
        let _ = dispatcher_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Pending transfers did not finish within {:?}", SHUTDOWN_GRACE);
    }

    status.snapshot().log();
    Ok(())
}

/// Configuration reload trigger (SIGHUP on unix).
struct ReloadSignal {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        let inner = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
        Ok(Self { inner })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        self.inner.recv().await;
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Shutdown signal received");
}
