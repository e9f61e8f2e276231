use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::alerts::AlertLevel;
use crate::balancer::SelectionStrategy;
use crate::error::{ScalingError, ScalingResult};
use crate::storage::retention::RetentionPolicy;

/// Storage history backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    /// In-memory history (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Usage rows older than this are deleted
        #[serde(default = "default_history_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageBackendConfig {
    fn default() -> Self {
        StorageBackendConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_history_retention_days(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./storage_history.db")
}

fn default_history_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this deployment unit
    pub instance_name: String,
    pub monitoring: MonitoringConfig,
    pub memory: MemoryConfig,
    pub processing: ProcessingConfig,
    pub balancer: BalancerConfig,
    pub scaling: ScalingConfig,
    pub storage: StorageConfig,

    /// Where alert notifications are delivered (optional)
    pub alert: Option<AlertTarget>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_name: crate::util::get_instance_name(),
            monitoring: MonitoringConfig::default(),
            memory: MemoryConfig::default(),
            processing: ProcessingConfig::default(),
            balancer: BalancerConfig::default(),
            scaling: ScalingConfig::default(),
            storage: StorageConfig::default(),
            alert: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTarget {
    Webhook(Webhook),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub url: String,
}

/// `{warning, critical, emergency}` percentages for one resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Thresholds {
    pub const fn new(warning: f64, critical: f64, emergency: f64) -> Self {
        Self {
            warning,
            critical,
            emergency,
        }
    }

    /// Threshold for an alert level (`Info` has none)
    pub fn for_level(&self, level: AlertLevel) -> Option<f64> {
        match level {
            AlertLevel::Info => None,
            AlertLevel::Warning => Some(self.warning),
            AlertLevel::Critical => Some(self.critical),
            AlertLevel::Emergency => Some(self.emergency),
        }
    }

    fn validate(&self, name: &str) -> ScalingResult<()> {
        if !(self.warning <= self.critical && self.critical <= self.emergency) {
            return Err(ScalingError::InvalidConfig(format!(
                "{name} thresholds must be ascending (warning <= critical <= emergency)"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu: Thresholds,
    pub memory: Thresholds,
    pub disk: Thresholds,
    /// Network usage is a percentage of `network_capacity_bytes_per_sec`
    pub network: Option<Thresholds>,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: Thresholds::new(70.0, 85.0, 95.0),
            memory: Thresholds::new(75.0, 90.0, 98.0),
            disk: Thresholds::new(80.0, 90.0, 95.0),
            network: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_secs: u64,
    /// Snapshots kept per resource type
    pub history_size: usize,
    pub alert_history_size: usize,
    /// An open alert resolves once usage drops below `threshold * resolve_ratio`
    pub resolve_ratio: f64,
    /// Link capacity used to express network throughput as a percentage
    pub network_capacity_bytes_per_sec: u64,
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            history_size: 120,
            alert_history_size: 1000,
            resolve_ratio: 0.9,
            network_capacity_bytes_per_sec: 125_000_000,
            thresholds: AlertThresholds::default(),
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Minimum time between two effective cleanups
    pub cleanup_cooldown_secs: u64,
    pub max_cache_entries: usize,
    pub cleanup_history_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cleanup_cooldown_secs: 60,
            max_cache_entries: 10_000,
            cleanup_history_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained dispatch rate
    pub max_per_second: f64,
    /// Bucket size
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_concurrent_tasks: usize,
    pub max_queue_size: usize,
    pub default_max_retries: u32,
    pub default_timeout_secs: u64,
    pub default_memory_limit_mb: u64,
    pub health_check_interval_secs: u64,
    /// Terminal tasks kept for status queries
    pub history_limit: usize,
    pub shutdown_timeout_secs: u64,
    /// Delay before a deferred dispatch is retried
    pub dispatch_retry_ms: u64,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_queue_size: 10_000,
            default_max_retries: 3,
            default_timeout_secs: 300,
            default_memory_limit_mb: 0,
            health_check_interval_secs: 30,
            history_limit: 1000,
            shutdown_timeout_secs: 30,
            dispatch_retry_ms: 100,
            rate_limit: None,
        }
    }
}

impl ProcessingConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn dispatch_retry(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub name: String,
    pub strategy: SelectionStrategy,
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub max_concurrent_per_worker: usize,
    /// Weight given to new workers (weighted round robin)
    pub worker_weight: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            strategy: SelectionStrategy::LeastConnections,
            min_workers: 1,
            max_workers: 10,
            initial_workers: 2,
            max_concurrent_per_worker: 4,
            worker_weight: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub monitor_interval_secs: u64,
    pub auto_scaling: bool,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    /// System load (0..1) above which every pool degrades
    pub degradation_threshold: f64,
    /// Degraded pools restore below `degradation_threshold * restore_ratio`
    pub restore_ratio: f64,
    pub overload_cpu_percent: f64,
    pub overload_memory_mb: f64,
    pub scaling_history_size: usize,
    pub pools: Vec<PoolConfig>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 10,
            auto_scaling: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown_secs: 300,
            scale_down_cooldown_secs: 600,
            degradation_threshold: 0.95,
            restore_ratio: 0.8,
            overload_cpu_percent: 90.0,
            overload_memory_mb: 2048.0,
            scaling_history_size: 100,
            pools: vec![PoolConfig::default()],
        }
    }
}

impl BalancerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_secs)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_secs)
    }
}

/// A `(cpu, memory)` percentage pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadThreshold {
    pub cpu: f64,
    pub memory: f64,
}

impl LoadThreshold {
    pub const fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory }
    }

    /// Either resource at or above its bound
    pub fn reached_by(&self, cpu: f64, memory: f64) -> bool {
        cpu >= self.cpu || memory >= self.memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    pub window_minutes: u64,
    pub interval_secs: u64,
    pub horizon_minutes: u64,
    pub confidence_threshold: f64,
    pub min_samples: usize,
    /// Utilization the recommended worker count aims for
    pub target_utilization: f64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_minutes: 120,
            interval_secs: 300,
            horizon_minutes: 15,
            confidence_threshold: 0.8,
            min_samples: 12,
            target_utilization: 70.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub check_interval_secs: u64,
    pub decision_interval_secs: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_scale_factor: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub scale_down: LoadThreshold,
    pub scale_up: LoadThreshold,
    pub degradation: LoadThreshold,
    pub emergency: LoadThreshold,
    /// Snapshots used to compute the cpu/memory trend
    pub trend_window: usize,
    pub decision_history_size: usize,
    pub predictive: PredictiveConfig,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            decision_interval_secs: 30,
            min_workers: 1,
            max_workers: 20,
            worker_scale_factor: 1.5,
            scale_up_cooldown_secs: 120,
            scale_down_cooldown_secs: 300,
            scale_down: LoadThreshold::new(30.0, 40.0),
            scale_up: LoadThreshold::new(70.0, 75.0),
            degradation: LoadThreshold::new(90.0, 90.0),
            emergency: LoadThreshold::new(95.0, 95.0),
            trend_window: 10,
            decision_history_size: 200,
            predictive: PredictiveConfig::default(),
        }
    }
}

impl ScalingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn decision_interval(&self) -> Duration {
        Duration::from_secs(self.decision_interval_secs.max(1))
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_secs)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredPath {
    pub path: PathBuf,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    pub instance_name: Option<String>,
}

fn default_data_type() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub archive_dir: PathBuf,
    /// Expected compressed size relative to the original, for estimates
    pub compression_ratio_estimate: f64,
    pub cleanup_history_size: usize,
    pub policies: Vec<RetentionPolicy>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("./archive"),
            compression_ratio_estimate: 0.4,
            cleanup_history_size: 100,
            policies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageAlertingConfig {
    pub check_interval_secs: u64,
    pub alert_cooldown_minutes: i64,
    pub report_interval_hours: u64,
    /// Synthetic alert when a path is projected full within this many days
    pub full_within_days: f64,
    /// Synthetic alert when daily growth exceeds this share of capacity
    pub growth_percent_per_day: f64,
    pub report_history_size: usize,
}

impl Default for StorageAlertingConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 900,
            alert_cooldown_minutes: 60,
            report_interval_hours: 24,
            full_within_days: 30.0,
            growth_percent_per_day: 2.0,
            report_history_size: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub monitor_interval_secs: u64,
    pub paths: Vec<MonitoredPath>,
    pub thresholds: Thresholds,
    pub resolve_ratio: f64,
    pub growth_window_days: i64,
    /// Run retention cleanup when an alert at or above `cleanup_level` opens
    pub auto_cleanup: bool,
    pub cleanup_level: AlertLevel,
    pub alert_history_size: usize,
    pub backend: StorageBackendConfig,
    pub retention: RetentionConfig,
    pub alerting: StorageAlertingConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 300,
            paths: Vec::new(),
            thresholds: Thresholds::new(80.0, 90.0, 95.0),
            resolve_ratio: 0.9,
            growth_window_days: 7,
            auto_cleanup: true,
            cleanup_level: AlertLevel::Critical,
            alert_history_size: 1000,
            backend: StorageBackendConfig::default(),
            retention: RetentionConfig::default(),
            alerting: StorageAlertingConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

impl Config {
    /// Reject configurations the control loops cannot honour
    pub fn validate(&self) -> ScalingResult<()> {
        let thresholds = &self.monitoring.thresholds;
        thresholds.cpu.validate("cpu")?;
        thresholds.memory.validate("memory")?;
        thresholds.disk.validate("disk")?;
        if let Some(network) = &thresholds.network {
            network.validate("network")?;
        }
        self.storage.thresholds.validate("storage")?;

        if self.processing.max_concurrent_tasks == 0 {
            return Err(ScalingError::InvalidConfig(
                "processing.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }

        let scaling = &self.scaling;
        if scaling.min_workers == 0 || scaling.min_workers > scaling.max_workers {
            return Err(ScalingError::InvalidConfig(format!(
                "scaling bounds invalid: min {} max {}",
                scaling.min_workers, scaling.max_workers
            )));
        }
        if scaling.worker_scale_factor <= 1.0 {
            return Err(ScalingError::InvalidConfig(
                "scaling.worker_scale_factor must be greater than 1".to_string(),
            ));
        }
        let ordered = |low: &LoadThreshold, high: &LoadThreshold| {
            low.cpu < high.cpu && low.memory < high.memory
        };
        if !(ordered(&scaling.scale_down, &scaling.scale_up)
            && ordered(&scaling.scale_up, &scaling.degradation)
            && ordered(&scaling.degradation, &scaling.emergency))
        {
            return Err(ScalingError::InvalidConfig(
                "scaling thresholds must ascend: scale_down < scale_up < degradation < emergency"
                    .to_string(),
            ));
        }

        let balancer = &self.balancer;
        if balancer.scale_down_threshold >= balancer.scale_up_threshold {
            return Err(ScalingError::InvalidConfig(
                "balancer.scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        for pool in &balancer.pools {
            if pool.min_workers == 0
                || pool.min_workers > pool.max_workers
                || pool.max_concurrent_per_worker == 0
            {
                return Err(ScalingError::InvalidConfig(format!(
                    "pool {} has invalid bounds",
                    pool.name
                )));
            }
        }

        Ok(())
    }
}

/// Load a JSON or TOML configuration file (chosen by extension)
pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&file_content)
            .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?,
        _ => serde_json::from_str(&file_content)
            .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?,
    };

    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
