//! Disk usage sampling, alerting and growth projection per monitored path

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sysinfo::Disks;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::actors::messages::AlertEvent;
use crate::alerts::{Alert, AlertTracker, AlertTransition};
use crate::config::{MonitoredPath, StorageBackendConfig, StorageConfig};
use crate::error::{ScalingError, ScalingResult};
use crate::monitors::resources::ResourceType;
use crate::stats::linear_regression;

use super::backend::{StorageBackend, UsageQuery};
use super::retention::{CleanupResult, DataRetentionManager};
use super::schema::{CleanupTrigger, StorageUsage};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Capacity of the filesystem holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Source of filesystem capacity for a path
pub trait DiskProbe: Send + Sync {
    fn disk_space(&self, path: &Path) -> ScalingResult<DiskSpace>;
}

/// Filesystem capacity via `sysinfo`; the disk with the longest matching mount point wins
pub struct SystemDiskProbe {
    disks: Mutex<Disks>,
}

impl SystemDiskProbe {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemDiskProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskProbe for SystemDiskProbe {
    fn disk_space(&self, path: &Path) -> ScalingResult<DiskSpace> {
        let path = fs::canonicalize(path)?;
        let mut disks = self
            .disks
            .lock()
            .map_err(|_| ScalingError::MonitoringSample("disk list lock poisoned".to_string()))?;
        disks.refresh(true);

        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| DiskSpace {
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .ok_or_else(|| {
                ScalingError::MonitoringSample(format!("no disk holds {}", path.display()))
            })
    }
}

/// Fixed capacities per path; clones share the same table
#[derive(Debug, Clone, Default)]
pub struct ScriptedDiskProbe {
    spaces: Arc<Mutex<HashMap<PathBuf, DiskSpace>>>,
}

impl ScriptedDiskProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, total_bytes: u64, available_bytes: u64) {
        if let Ok(mut spaces) = self.spaces.lock() {
            spaces.insert(
                path.into(),
                DiskSpace {
                    total_bytes,
                    available_bytes,
                },
            );
        }
    }
}

impl DiskProbe for ScriptedDiskProbe {
    fn disk_space(&self, path: &Path) -> ScalingResult<DiskSpace> {
        let spaces = self
            .spaces
            .lock()
            .map_err(|_| ScalingError::MonitoringSample("scripted probe poisoned".to_string()))?;
        spaces.get(path).copied().ok_or_else(|| {
            ScalingError::MonitoringSample(format!("no scripted space for {}", path.display()))
        })
    }
}

/// Total size of the regular files below `path`; symlinks are not followed
pub fn directory_size(path: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(if metadata.is_file() { metadata.len() } else { 0 });
    }

    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            total += directory_size(&entry.path()).unwrap_or(0);
        } else if file_type.is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrowthAnalysis {
    pub path: String,
    pub samples: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub growth_bytes_per_day: f64,
    /// Daily growth as a share of the filesystem capacity
    pub growth_percent_per_day: f64,
    /// Only set while usage is growing
    pub days_until_full: Option<f64>,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub r_squared: f64,
}

/// Least-squares growth of used bytes over time
///
/// `None` for fewer than two samples or when all samples share a timestamp.
pub fn project_growth(
    path: &str,
    samples: &[(DateTime<Utc>, u64)],
    free_bytes: u64,
    total_bytes: u64,
) -> Option<GrowthAnalysis> {
    let first = samples.iter().map(|(at, _)| *at).min()?;
    let last = samples.iter().map(|(at, _)| *at).max()?;
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|(at, used)| ((*at - first).num_milliseconds() as f64 / MILLIS_PER_DAY, *used as f64))
        .collect();
    let fit = linear_regression(&points)?;

    let days_until_full = (fit.slope > 0.0).then(|| free_bytes as f64 / fit.slope);
    let growth_percent_per_day = if total_bytes == 0 {
        0.0
    } else {
        fit.slope / total_bytes as f64 * 100.0
    };
    let used_bytes = samples
        .iter()
        .max_by_key(|(at, _)| *at)
        .map(|(_, used)| *used)
        .unwrap_or(0);

    Some(GrowthAnalysis {
        path: path.to_string(),
        samples: samples.len(),
        window_start: first,
        window_end: last,
        growth_bytes_per_day: fit.slope,
        growth_percent_per_day,
        days_until_full,
        used_bytes,
        free_bytes,
        total_bytes,
        r_squared: fit.r_squared,
    })
}

#[derive(Debug)]
struct StorageMonitorState {
    alerts: AlertTracker,
    latest: HashMap<String, StorageUsage>,
}

/// Samples every monitored path, persists the history and raises alerts
///
/// An alert opening at or above the configured cleanup level runs the
/// retention policies of that path.
pub struct StorageMonitor {
    config: StorageConfig,
    instance_name: String,
    probe: Arc<dyn DiskProbe>,
    backend: Arc<dyn StorageBackend>,
    retention: Arc<DataRetentionManager>,
    state: RwLock<StorageMonitorState>,
    alert_tx: broadcast::Sender<AlertEvent>,
}

impl fmt::Debug for StorageMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageMonitor")
            .field("instance_name", &self.instance_name)
            .field("paths", &self.config.paths.len())
            .finish()
    }
}

impl StorageMonitor {
    pub fn new(
        config: StorageConfig,
        instance_name: impl Into<String>,
        probe: Arc<dyn DiskProbe>,
        backend: Arc<dyn StorageBackend>,
        retention: Arc<DataRetentionManager>,
        alert_tx: broadcast::Sender<AlertEvent>,
    ) -> Self {
        let alerts = AlertTracker::new(config.resolve_ratio, config.alert_history_size);
        Self {
            config,
            instance_name: instance_name.into(),
            probe,
            backend,
            retention,
            state: RwLock::new(StorageMonitorState {
                alerts,
                latest: HashMap::new(),
            }),
            alert_tx,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn retention(&self) -> &Arc<DataRetentionManager> {
        &self.retention
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    /// Take one usage sample of a monitored path
    pub async fn sample_path(&self, monitored: &MonitoredPath) -> ScalingResult<StorageUsage> {
        let probe = self.probe.clone();
        let path = monitored.path.clone();

        let (space, directory_bytes) = tokio::task::spawn_blocking(move || {
            let space = probe.disk_space(&path)?;
            let directory_bytes = directory_size(&path)?;
            Ok::<_, ScalingError>((space, directory_bytes))
        })
        .await
        .map_err(|e| ScalingError::MonitoringSample(e.to_string()))??;

        Ok(StorageUsage::new(
            monitored.path.display().to_string(),
            space.total_bytes,
            space.available_bytes,
            directory_bytes,
            monitored.data_type.clone(),
            Some(
                monitored
                    .instance_name
                    .clone()
                    .unwrap_or_else(|| self.instance_name.clone()),
            ),
            Utc::now(),
        ))
    }

    /// Sample, persist and evaluate every monitored path
    ///
    /// A path that cannot be sampled is skipped for this round.
    #[instrument(skip(self))]
    pub async fn check_all(&self) -> Vec<StorageUsage> {
        let mut usages = Vec::with_capacity(self.config.paths.len());
        for monitored in &self.config.paths {
            match self.sample_path(monitored).await {
                Ok(usage) => usages.push(usage),
                Err(e) => warn!("skipping storage sample of {}: {e}", monitored.path.display()),
            }
        }

        self.record(usages.clone()).await;
        usages
    }

    /// Persist samples, evaluate alerts and run alert-triggered cleanups
    pub async fn record(&self, usages: Vec<StorageUsage>) -> Vec<AlertTransition> {
        if usages.is_empty() {
            return Vec::new();
        }

        if let Err(e) = self.backend.insert_usage_batch(usages.clone()).await {
            warn!("failed to persist storage usage: {e}");
        }

        let transitions: Vec<AlertTransition> = {
            let mut state = self.state.write().await;
            let state = &mut *state;
            usages
                .into_iter()
                .flat_map(|usage| {
                    let transitions = state.alerts.evaluate(
                        &usage.path,
                        ResourceType::Disk,
                        usage.usage_percentage,
                        &self.config.thresholds,
                        usage.timestamp,
                    );
                    state.latest.insert(usage.path.clone(), usage);
                    transitions
                })
                .collect()
        };

        let mut cleanup_paths: Vec<String> = Vec::new();
        for transition in &transitions {
            let _ = self.alert_tx.send(transition.clone().into_event());

            let AlertTransition::Opened(alert) = transition else {
                continue;
            };
            if self.config.auto_cleanup
                && alert.level >= self.config.cleanup_level
                && !cleanup_paths.contains(&alert.subject)
            {
                cleanup_paths.push(alert.subject.clone());
            }
        }

        for path in cleanup_paths {
            self.cleanup_path(&path).await;
        }

        transitions
    }

    /// Run the retention policies that apply to one monitored path
    #[instrument(skip(self))]
    pub async fn cleanup_path(&self, path: &str) -> Option<CleanupResult> {
        let monitored = self
            .config
            .paths
            .iter()
            .find(|m| m.path.display().to_string() == path)?;
        let instance = monitored
            .instance_name
            .as_deref()
            .unwrap_or(&self.instance_name);

        let recommendations = match self
            .retention
            .analyze_scoped(&monitored.path, Some(instance), Some(&monitored.data_type))
            .await
        {
            Ok(recommendations) => recommendations,
            Err(e) => {
                warn!("retention analysis of {path} failed: {e}");
                return None;
            }
        };

        if recommendations.is_empty() {
            info!("storage alert on {path}, but no retention rule matches");
            return None;
        }

        let result = self
            .retention
            .execute_cleanup_with(&recommendations, false, CleanupTrigger::Alert)
            .await;
        info!(
            "alert cleanup of {path} freed {}",
            crate::util::format_bytes(result.bytes_freed)
        );
        Some(result)
    }

    /// Growth over the trailing window, using the persisted history
    pub async fn growth_analysis(&self, path: &str) -> ScalingResult<Option<GrowthAnalysis>> {
        let now = Utc::now();
        let history = self
            .backend
            .query_usage_range(UsageQuery {
                path: path.to_string(),
                start: now - TimeDelta::days(self.config.growth_window_days),
                end: now,
                limit: None,
            })
            .await?;

        let Some(newest) = history.iter().max_by_key(|u| u.timestamp) else {
            return Ok(None);
        };
        let samples: Vec<(DateTime<Utc>, u64)> =
            history.iter().map(|u| (u.timestamp, u.used_bytes)).collect();

        Ok(project_growth(
            path,
            &samples,
            newest.free_bytes,
            newest.total_bytes,
        ))
    }

    /// Latest sample of every path, sorted by path
    pub async fn latest_usage(&self) -> Vec<StorageUsage> {
        let mut latest: Vec<StorageUsage> =
            self.state.read().await.latest.values().cloned().collect();
        latest.sort_by(|a, b| a.path.cmp(&b.path));
        latest
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.state.read().await.alerts.open_alerts()
    }

    pub async fn alert_history(&self) -> Vec<Alert> {
        self.state.read().await.alerts.history()
    }

    /// Drop persisted usage rows older than `retention_days`
    pub async fn prune_history(&self, retention_days: u32) -> ScalingResult<usize> {
        let before = Utc::now() - TimeDelta::days(retention_days as i64);
        Ok(self.backend.cleanup_old_usage(before).await?)
    }

    /// Sample on the configured interval until shutdown; prunes history daily
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(
            "starting storage monitor for {} paths with interval {:?}",
            self.config.paths.len(),
            self.config.monitor_interval()
        );
        let retention_days = match &self.config.backend {
            StorageBackendConfig::Sqlite { retention_days, .. } => Some(*retention_days),
            StorageBackendConfig::None => None,
        };
        let mut ticker = tokio::time::interval(self.config.monitor_interval());
        let mut prune_ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = prune_ticker.tick(), if retention_days.is_some() => {
                    let days = retention_days.unwrap_or_default();
                    match self.prune_history(days).await {
                        Ok(deleted) => debug!("pruned {deleted} storage usage rows"),
                        Err(e) => warn!("failed to prune storage history: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("storage monitor received shutdown");
                    break;
                }
            }
        }
    }
}
