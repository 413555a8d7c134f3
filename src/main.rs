use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chaos_driver::AppError;
use chaos_driver::config::{AppConfig, load_config};
use chaos_driver::health::ClusterHealthMonitor;
use chaos_driver::listener::ProtocolListener;
use chaos_driver::orchestrator::{TestOrchestrator, populate_store, steady_state_probes};
use chaos_driver::responder::ProtocolResponder;
use chaos_driver::store::{KvStore, MemoryStore};

#[derive(Debug, Parser)]
#[command(name = "chaos-driver")]
#[command(about = "Chaos-testing load driver for distributed key-value clusters")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Run the driver coordinated by a remote chaos-agent peer.
    Drive {
        #[arg(long, default_value = "config/driver.toml")]
        config: PathBuf,
    },
    /// Run a fully self-driven test against the in-memory backend.
    Local {
        #[arg(long, default_value = "config/local.toml")]
        config: PathBuf,
    },
}

fn init_tracing() -> Result<(), AppError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|_| AppError::TracingInit)
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.mode {
        Mode::Drive { config } => {
            let app_config = load_config(&config)?;
            info!(path = %config.display(), "starting driver in peer-coordinated mode");
            run_driver(app_config, false).await
        }
        Mode::Local { config } => {
            let app_config = load_config(&config)?;
            info!(path = %config.display(), "starting driver in local test mode");
            run_driver(app_config, true).await
        }
    }
}

async fn run_driver(config: AppConfig, local_mode: bool) -> Result<(), AppError> {
    let responder = Arc::new(ProtocolResponder::new(Duration::from_millis(
        config.test.responder_wait_timeout_ms,
    )));

    info!(bind_addr = %config.listener.bind_addr, "starting protocol listener");
    let protocol_listener =
        ProtocolListener::bind(config.listener.bind_addr, responder.clone()).await?;
    let (listener_shutdown_tx, listener_shutdown_rx) = watch::channel(false);
    let listener_task = tokio::spawn(protocol_listener.run_until_shutdown(listener_shutdown_rx));

    if !local_mode {
        let peer = responder.await_peer_address().await;
        info!(peer = %peer, "chaos agent peer announced itself");
    }

    // The cluster client delivers membership and migration events on this
    // channel. The in-memory backend has no event source; the sender is
    // kept open so the monitor idles instead of exiting.
    let health = Arc::new(ClusterHealthMonitor::new(config.cluster.expected_members));
    let (_event_tx, event_rx) = mpsc::unbounded_channel();
    let health_task = {
        let health = health.clone();
        tokio::spawn(async move { health.run(event_rx).await })
    };

    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    store.await_connected()?;

    let boundary = populate_store(&store, &config).await?;
    let probes = steady_state_probes(&store, boundary, &config);

    let mut orchestrator = TestOrchestrator::new(
        config,
        probes,
        health,
        responder,
        local_mode,
    );
    orchestrator.run().await?;

    let _ = listener_shutdown_tx.send(true);
    match listener_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(%error, "protocol listener failed"),
        Err(join_error) => warn!(%join_error, "listener task ended abnormally"),
    }
    health_task.abort();

    Ok(())
}
