use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use resource_scaler::{
    ConcurrentProcessor, DataRetentionManager, LoadBalancer, MemoryManager, ResourceMonitor,
    ScalabilityManager, StorageAlertingService, StorageMonitor,
    actors::notifier::NotifierHandle,
    alerts::AlertManager,
    config::{Config, read_config_file},
    monitors::source::{SystemMetricsSource, shared},
    storage::{SystemDiskProbe, create_backend},
    supervisor::{DEFAULT_BACKOFF, spawn_supervised},
    util::{get_config_path, get_log_level},
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (falls back to $SCALER_CONFIG, then built-in defaults)
    #[arg(short)]
    file: Option<String>,
}

fn init() {
    let level = get_log_level();
    let filter = filter::Targets::new()
        .with_targets(vec![("resource_scaler", level), ("scaler", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    match args.file.clone().or_else(get_config_path) {
        Some(path) => read_config_file(&path),
        None => {
            info!("no config file given, using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = load_config(&args)?;
    let instance_name = config.instance_name.clone();
    info!("starting resource scaler for instance {instance_name}");

    let (alert_tx, alert_rx) = broadcast::channel(256);

    let notifier = config.alert.clone().map(|target| {
        debug!("alert notifications enabled");
        NotifierHandle::spawn(AlertManager::new(target, instance_name.clone()), alert_rx)
    });

    let metrics = shared(SystemMetricsSource::new());
    let monitor = Arc::new(ResourceMonitor::new(
        metrics.clone(),
        config.monitoring.clone(),
        alert_tx.clone(),
    ));
    let memory = Arc::new(MemoryManager::new(
        metrics,
        config.monitoring.thresholds.memory,
        config.memory.clone(),
    ));
    let balancer = Arc::new(LoadBalancer::new(config.balancer.clone()));
    let processor = ConcurrentProcessor::new(
        config.processing.clone(),
        instance_name.clone(),
        Arc::clone(&memory),
        Some(Arc::clone(&balancer)),
    );
    let manager = Arc::new(ScalabilityManager::new(
        instance_name.clone(),
        config.scaling.clone(),
        monitor,
        memory,
        processor,
        balancer,
    ));

    let backend = create_backend(&config.storage.backend)
        .await
        .context("failed to open storage history backend")?;
    let retention = Arc::new(DataRetentionManager::new(
        config.storage.retention.clone(),
        Some(Arc::clone(&backend)),
    ));
    let storage_monitor = Arc::new(StorageMonitor::new(
        config.storage.clone(),
        instance_name.clone(),
        Arc::new(SystemDiskProbe::new()),
        Arc::clone(&backend),
        retention,
        alert_tx.clone(),
    ));
    let storage_alerting = Arc::new(StorageAlertingService::new(
        config.storage.alerting.clone(),
        instance_name.clone(),
        Arc::clone(&storage_monitor),
        alert_tx,
    ));

    manager.start().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut storage_loops = vec![];
    if !config.storage.paths.is_empty() {
        let shutdown = shutdown_rx.clone();
        let monitor = Arc::clone(&storage_monitor);
        storage_loops.push(spawn_supervised(
            "storage monitor",
            shutdown_rx.clone(),
            DEFAULT_BACKOFF,
            move || {
                let monitor = Arc::clone(&monitor);
                let shutdown = shutdown.clone();
                async move { monitor.run(shutdown).await }
            },
        ));

        let shutdown = shutdown_rx.clone();
        let alerting = Arc::clone(&storage_alerting);
        storage_loops.push(spawn_supervised(
            "storage alerting",
            shutdown_rx.clone(),
            DEFAULT_BACKOFF,
            move || {
                let alerting = Arc::clone(&alerting);
                let shutdown = shutdown.clone();
                async move { alerting.run(shutdown).await }
            },
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c, shutting down");

    let report = manager.shutdown(config.processing.shutdown_timeout()).await;
    info!(
        "processor drained: {} pending cancelled, {} running force-cancelled",
        report.cancelled_pending, report.force_cancelled
    );

    let _ = shutdown_tx.send(true);
    for handle in storage_loops {
        if let Err(e) = handle.await {
            warn!("storage loop ended abnormally: {e}");
        }
    }
    if let Err(e) = backend.close().await {
        warn!("failed to close storage backend: {e}");
    }
    if let Some(notifier) = notifier {
        notifier.shutdown().await;
    }

    Ok(())
}
