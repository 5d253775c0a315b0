//! wanctl autorate daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use wanctl_autorate::controller::AutorateController;
use wanctl_autorate::health::{self, HealthState};
use wanctl_common::config::AutorateConfig;
use wanctl_common::lock::FileLock;
use wanctl_common::shutdown::{install_signal_handlers, shutdown_pair, ShutdownSignal};
use wanctl_router::RouterBackend;
use wanctl_store::MetricsStore;

/// wanctl autorate daemon.
#[derive(Parser, Debug)]
#[command(name = "wanctl-autorate", about = "Adaptive CAKE rate controller for one WAN")]
struct Cli {
    /// Path to the per-WAN YAML config.
    #[arg(long)]
    config: PathBuf,

    /// Validate the config and exit.
    #[arg(long, default_value_t = false)]
    validate_config: bool,

    /// Run a single cycle and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Log router writes instead of issuing them.
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
    let cfg = match AutorateConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    if cli.validate_config {
        println!("configuration OK: wan {}", cfg.wan_name);
        return 0;
    }

    // Single-instance discipline: the lock guards the state file.
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

    // Startup gate: router reachable, queues resolvable.
    if !cli.dry_run {
        if let Err(e) = backend.test_connection().await {
            tracing::error!(error = %e, "router unreachable");
            return 1;
        }
        for queue in [&cfg.queues.download, &cfg.queues.upload] {
            match backend.get_queue_stats(queue).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::error!(queue, "queue not found on router");
                    return 1;
                }
                Err(e) => {
                    tracing::error!(queue, error = %e, "queue lookup failed");
                    return 1;
                }
            }
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

    let health = Arc::new(HealthState::new(
        cfg.wan_name.clone(),
        cfg.storage.db_path.clone(),
    ));

    // HTTP surface: a startup failure is a warning, not fatal.
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

    // Opportunistic store maintenance off the control loop.
    let maintenance_task = store.as_ref().map(|store| {
        tokio::spawn(maintenance_loop(
            store.clone(),
            cfg.storage.retention_days,
            shutdown.clone(),
        ))
    });

    let mut controller = AutorateController::new(cfg, backend, store, health, cli.dry_run);

    let code = if cli.once {
        let ok = controller.run_cycle().await;
        if ok {
            0
        } else {
            1
        }
    } else {
        controller.run_daemon(shutdown.clone()).await
    };

    shutdown_handle.trigger();
    if let Some(task) = maintenance_task {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    // Bounded join so a wedged socket cannot hold up shutdown.
    let _ = tokio::time::timeout(Duration::from_secs(5), health_task).await;

    code
}

/// Hourly retention + downsampling, polling shutdown between units.
async fn maintenance_loop(store: MetricsStore, retention_days: u32, mut shutdown: ShutdownSignal) {
    loop {
        if shutdown.sleep(Duration::from_secs(3_600)).await {
            return;
        }
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = store.apply_retention(retention_days, now).await {
            tracing::warn!(error = %e, "retention failed");
        }
        if shutdown.is_shutdown() {
            return;
        }
        if let Err(e) = wanctl_store::downsample::run_downsampling(&store, now).await {
            tracing::warn!(error = %e, "downsampling failed");
        }
    }
}
