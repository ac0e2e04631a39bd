//! Meridian federation node daemon.
//!
//! Runs the federation manager of one cluster: loads configuration, binds
//! the sibling listener, starts the background workers and shuts down
//! cleanly on SIGINT or SIGTERM.
//!
//! ## Usage
//!
//! ```text
//! meridian-fedd [OPTIONS]
//!
//! Options:
//!     --config <PATH>          TOML configuration file
//!     --cluster <NAME>         Name of the local cluster
//!     --listen <ADDR>          Sibling listener address
//!     --state-dir <DIR>        Directory for the federation state file
//!     --ignore-state-errors    Start empty instead of failing on a corrupt state file
//! ```
//!
//! Configuration precedence (lowest to highest): `MERIDIAN_*` environment
//! variables, the TOML file, command-line flags.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use meridian_federation::FederationConfig;
use meridian_federation::FederationListener;
use meridian_federation::FederationManager;
use meridian_federation::MemoryJobStore;
use meridian_federation::MessageHandler;
use meridian_federation::StaticAccountingProbe;
use meridian_federation::TcpTransport;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meridian-fedd", about = "Meridian federation node")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name of the local cluster.
    #[arg(long)]
    cluster: Option<String>,

    /// Address the sibling listener binds to.
    #[arg(long)]
    listen: Option<String>,

    /// Directory holding the federation state file.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Start with empty state when the state file is unusable.
    #[arg(long)]
    ignore_state_errors: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Layer environment, file and command-line configuration.
fn load_config(args: &Args) -> Result<FederationConfig> {
    let mut config = FederationConfig::from_env().context("failed to read MERIDIAN_* environment")?;

    if let Some(path) = &args.config {
        let file = FederationConfig::from_toml_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config.merge(file);
    }

    if let Some(cluster) = &args.cluster {
        config.cluster_name = cluster.clone();
    }
    if let Some(listen) = &args.listen {
        config.listen_address = listen.clone();
    }
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    if args.ignore_state_errors {
        config.ignore_state_errors = true;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args)?;

    let local = config.local_cluster_id().context("local cluster id")?;
    let listen_address = config.listen_address.clone();
    let connect_timeout = config.timing.connect_timeout();

    let manager = FederationManager::new(
        config,
        Arc::new(MemoryJobStore::new(local)),
        Arc::new(StaticAccountingProbe::default()),
        Arc::new(TcpTransport::new(connect_timeout)),
    )
    .context("failed to create federation manager")?;

    let listener = FederationListener::bind(&listen_address)
        .await
        .with_context(|| format!("failed to bind sibling listener on {listen_address}"))?;
    info!(address = %listen_address, cluster = %local, "sibling listener bound");

    manager.start();
    let handler: Arc<dyn MessageHandler> = manager.clone();
    let listener_task = tokio::spawn(listener.run(handler, manager.cancel_token()));

    shutdown_signal().await;

    manager.shutdown().await.context("federation manager shutdown")?;
    if let Err(err) = listener_task.await {
        error!(error = %err, "listener task failed");
    }
    info!("meridian-fedd stopped");
    Ok(())
}
