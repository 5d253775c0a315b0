//! wanctl steering daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wanctl_common::config::SteeringConfig;
use wanctl_common::lock::FileLock;
use wanctl_common::shutdown::{install_signal_handlers, shutdown_pair};
use wanctl_router::RouterBackend;
use wanctl_steer::daemon::SteerDaemon;
use wanctl_steer::health::{self, SteerHealth};
use wanctl_store::MetricsStore;

/// wanctl steering daemon.
#[derive(Parser, Debug)]
#[command(name = "wanctl-steer", about = "Dual-WAN steering authority")]
struct Cli {
    /// Path to the steering YAML config.
    #[arg(long)]
    config: PathBuf,

    /// Validate the config and exit.
    #[arg(long, default_value_t = false)]
    validate_config: bool,

    /// Run a single cycle and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Log mangle toggles instead of issuing them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let cfg = match SteeringConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    if cli.validate_config {
        println!("configuration OK: steering for {}", cfg.wan_name);
        return 0;
    }

    // Single-authority discipline: exactly one steering process.
    let _lock = match FileLock::acquire(&cfg.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "cannot start");
            return 1;
        }
    };

    let backend: Box<dyn RouterBackend> = match wanctl_router::backend_for(&cfg.router) {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, "router backend setup failed");
            return 1;
        }
    };

    if !cli.dry_run {
        if let Err(e) = backend.test_connection().await {
            tracing::error!(error = %e, "router unreachable");
            return 1;
        }
    }

    let store = if cfg.metrics.enabled {
        match MetricsStore::shared(&cfg.storage.db_path).await {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(error = %e, "metrics store unavailable, continuing without");
                None
            }
        }
    } else {
        None
    };

    let (shutdown_handle, shutdown) = shutdown_pair();
    install_signal_handlers(&shutdown_handle);

    let health = Arc::new(SteerHealth::new(cfg.clone()));
    let health_task = {
        let health = health.clone();
        let host = cfg.health.host.clone();
        let port = cfg.health.port;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(health, host, port, shutdown).await {
                tracing::warn!(error = %e, "health server failed");
            }
        })
    };

    let mut daemon = SteerDaemon::new(cfg, backend, store, health, cli.dry_run);

    let code = if cli.once {
        if daemon.run_cycle().await {
            0
        } else {
            1
        }
    } else {
        daemon.run_daemon_loop(shutdown.clone()).await
    };

    shutdown_handle.trigger();
    // Bounded join so a wedged socket cannot hold up shutdown.
    let _ = tokio::time::timeout(Duration::from_secs(5), health_task).await;

    code
}
