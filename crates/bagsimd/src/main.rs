//! bagsimd - The bag device simulation service
//!
//! This is the main entry point for the bagsimd service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization and device seeding
//! - Simulation engine (boot recovery, shutdown)
//! - HTTP API

mod http;

use anyhow::{Context, Result};
use clap::Parser;
use bagsim_config::{Settings, load_config};
use bagsim_core::SimulationEngine;
use bagsim_store::{AuditEventType, DeviceStore, SqliteStore};
use bagsim_util::{BAGSIM_CONFIG_ENV, BAGSIM_DATA_DIR_ENV, DATABASE_FILENAME, default_config_path};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::http::{AppState, build_router};

/// bagsimd - Battery and power simulation for bag devices
#[derive(Parser, Debug)]
#[command(name = "bagsimd")]
#[command(about = "Battery and power simulation for bag devices", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/bagsimd/config.toml)
    #[arg(short, long, env = BAGSIM_CONFIG_ENV, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Listen address override (or set BAGSIM_LISTEN env var)
    #[arg(long, env = "BAGSIM_LISTEN")]
    listen: Option<SocketAddr>,

    /// Data directory override (or set BAGSIM_DATA_DIR env var)
    #[arg(short, long, env = BAGSIM_DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// Passkey required on mutating HTTP routes (or set BAGSIM_ADMIN_PASSKEY env var)
    #[arg(long, env = "BAGSIM_ADMIN_PASSKEY", hide_env_values = true)]
    admin_passkey: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Main service state
struct Service {
    engine: Arc<SimulationEngine>,
    listen_addr: SocketAddr,
    admin_passkey: Option<String>,
}

impl Service {
    async fn new(args: &Args) -> Result<Self> {
        // Load configuration
        let settings = if args.config.exists() {
            let settings = load_config(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?;
            info!(
                config_path = %args.config.display(),
                seed_devices = settings.devices.len(),
                "Configuration loaded"
            );
            settings
        } else {
            warn!(
                config_path = %args.config.display(),
                "Config file not found, using defaults"
            );
            Settings::default()
        };

        // Command line wins over the file
        let listen_addr = args.listen.unwrap_or(settings.service.listen_addr);
        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.service.data_dir.clone());
        let admin_passkey = args
            .admin_passkey
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| settings.service.admin_passkey.clone());

        if admin_passkey.is_none() {
            warn!("No admin passkey configured, mutating routes are open");
        }

        // Create data directory
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        // Initialize store
        let db_path = data_dir.join(DATABASE_FILENAME);
        let store: Arc<dyn DeviceStore> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );

        info!(db_path = %db_path.display(), "Store initialized");

        // Initialize engine
        let engine = Arc::new(SimulationEngine::new(store, settings.simulation));
        engine.audit(AuditEventType::ServiceStarted).await;

        engine
            .seed_devices(&settings.devices)
            .await
            .context("Failed to register seed devices")?;

        Ok(Self {
            engine,
            listen_addr,
            admin_passkey,
        })
    }

    async fn run(self) -> Result<()> {
        let engine = self.engine;

        // Everything that can fail comes before the first simulation starts
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen_addr))?;

        info!(listen_addr = %self.listen_addr, "HTTP server listening");

        // Resume simulations for devices claimed before the restart
        if let Err(e) = engine.initialize_all_simulations().await {
            warn!(error = %e, "Failed to initialize simulations, continuing without them");
        }

        let shutdown = async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
                _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
            }
        };

        let router = build_router(AppState::new(engine.clone(), self.admin_passkey));
        serve_until_shutdown(&engine, listener, router, shutdown).await?;

        info!("Shutdown complete");
        Ok(())
    }
}

/// Serve HTTP until `shutdown` resolves, then halt every simulation.
///
/// Simulations are stopped and the stop is audited whether or not the
/// server exited cleanly; the server's error is returned afterwards.
async fn serve_until_shutdown(
    engine: &SimulationEngine,
    listener: tokio::net::TcpListener,
    router: axum::Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;

    info!("Shutting down bagsimd");

    let simulations_stopped = engine.stop_all_simulations().await;
    engine
        .audit(AuditEventType::ServiceStopped {
            simulations_stopped,
        })
        .await;

    served.context("HTTP server error")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "bagsimd starting");

    // Create and run the service
    let service = Service::new(&args).await?;
    service.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bagsim_config::SimulationConfig;
    use bagsim_store::InstrumentedStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_stops_simulations_and_audits() {
        let store = Arc::new(InstrumentedStore::new());
        store.seed("A", true, true, 100);
        store.seed("B", true, false, 100);

        let config = SimulationConfig {
            tick_interval: Duration::from_millis(10),
            ..SimulationConfig::default()
        };
        let engine = Arc::new(SimulationEngine::new(store.clone(), config));
        assert_eq!(engine.initialize_all_simulations().await.unwrap(), 2);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = build_router(AppState::new(engine.clone(), None));
        serve_until_shutdown(&engine, listener, router, async {})
            .await
            .unwrap();

        assert!(engine.get_running_simulations().is_empty());
        let writes = store.update_count();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.update_count(), writes);

        let latest = store.get_recent_audits(1).unwrap();
        assert!(matches!(
            latest.first().map(|e| &e.event),
            Some(AuditEventType::ServiceStopped {
                simulations_stopped: 2
            })
        ));
    }
}
