//! Builders shared by the integration tests

#![allow(dead_code)]

use std::fs::{self, File};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use resource_scaler::actors::messages::AlertEvent;
use resource_scaler::config::{
    BalancerConfig, MemoryConfig, MonitoredPath, MonitoringConfig, PoolConfig, ProcessingConfig,
    RetentionConfig, ScalingConfig, StorageBackendConfig, StorageConfig, Thresholds,
};
use resource_scaler::monitors::source::{ScriptedMetricsSource, SystemReadings, shared};
use resource_scaler::storage::{
    DataRetentionManager, ScriptedDiskProbe, StorageBackend, StorageMonitor,
};
use resource_scaler::{
    ConcurrentProcessor, LoadBalancer, MemoryManager, ResourceMonitor, ScalabilityManager,
};
use tokio::sync::broadcast;

pub const GB: u64 = 1_000_000_000;

/// One instance wired the way the binary wires it, fed by scripted readings
pub struct TestStack {
    /// Readings seen by the resource monitor
    pub source: ScriptedMetricsSource,
    pub monitor: Arc<ResourceMonitor>,
    pub memory: Arc<MemoryManager>,
    pub balancer: Arc<LoadBalancer>,
    pub processor: ConcurrentProcessor,
    pub manager: Arc<ScalabilityManager>,
    pub alerts: broadcast::Receiver<AlertEvent>,
}

pub fn fast_monitoring() -> MonitoringConfig {
    MonitoringConfig {
        interval_secs: 1,
        ..Default::default()
    }
}

pub fn create_test_stack(
    monitoring: MonitoringConfig,
    processing: ProcessingConfig,
    scaling: ScalingConfig,
    workers: usize,
) -> TestStack {
    let source = ScriptedMetricsSource::new();
    let (alert_tx, alerts) = broadcast::channel(256);
    let monitor = Arc::new(ResourceMonitor::new(
        shared(source.clone()),
        monitoring,
        alert_tx,
    ));

    // a separate source so memory checks never consume scripted readings
    let memory_source = ScriptedMetricsSource::steady(SystemReadings::with_usage(10.0, 30.0));
    let memory = Arc::new(MemoryManager::new(
        shared(memory_source),
        Thresholds::new(75.0, 90.0, 98.0),
        MemoryConfig::default(),
    ));

    let balancer = Arc::new(LoadBalancer::new(BalancerConfig {
        auto_scaling: false,
        pools: vec![PoolConfig {
            min_workers: 1,
            max_workers: 16,
            initial_workers: workers,
            ..Default::default()
        }],
        ..Default::default()
    }));

    let processor = ConcurrentProcessor::new(
        processing,
        "integration",
        Arc::clone(&memory),
        Some(Arc::clone(&balancer)),
    );
    let manager = Arc::new(ScalabilityManager::new(
        "integration",
        scaling,
        Arc::clone(&monitor),
        Arc::clone(&memory),
        processor.clone(),
        Arc::clone(&balancer),
    ));

    TestStack {
        source,
        monitor,
        memory,
        balancer,
        processor,
        manager,
        alerts,
    }
}

/// Poll `check` until it holds or `timeout` expires
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Write a file whose modification time lies `days` in the past
pub fn write_aged(path: &Path, contents: &[u8], days: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(days * 86_400))
        .unwrap();
}

pub fn monitored(path: &Path, data_type: &str) -> MonitoredPath {
    MonitoredPath {
        path: path.to_path_buf(),
        data_type: data_type.to_string(),
        instance_name: None,
    }
}

/// Storage monitor over scripted disk readings
pub fn create_storage_monitor(
    paths: Vec<MonitoredPath>,
    probe: &ScriptedDiskProbe,
    retention: RetentionConfig,
    backend: Arc<dyn StorageBackend>,
) -> (Arc<StorageMonitor>, broadcast::Sender<AlertEvent>) {
    let (alert_tx, _) = broadcast::channel(256);
    let retention = Arc::new(DataRetentionManager::new(retention, Some(backend.clone())));
    let monitor = StorageMonitor::new(
        StorageConfig {
            paths,
            backend: StorageBackendConfig::None,
            ..Default::default()
        },
        "integration",
        Arc::new(probe.clone()),
        backend,
        retention,
        alert_tx.clone(),
    );
    (Arc::new(monitor), alert_tx)
}
