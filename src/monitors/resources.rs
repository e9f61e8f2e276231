use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, instrument, trace, warn};

use crate::actors::messages::AlertEvent;
use crate::alerts::{Alert, AlertTracker};
use crate::config::{MonitoringConfig, Thresholds};
use crate::error::ScalingResult;

use super::source::{SharedMetricsSource, SystemReadings, read_shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceType {
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Disk,
        ResourceType::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Disk => "disk",
            ResourceType::Network => "network",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded sample of a resource; never mutated after recording
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub resource_type: ResourceType,
    pub timestamp: DateTime<Utc>,
    /// Usage in percent
    pub current_usage: f64,
    /// Mean usage over the retained history
    pub average_usage: f64,
    /// Highest usage over the retained history
    pub peak_usage: f64,
    /// Capacity in native units (bytes, bytes/s, or percent for cpu)
    pub total_capacity: f64,
    pub available_capacity: f64,
}

/// Latest usage of every resource, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemLoad {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct MonitorState {
    history: HashMap<ResourceType, VecDeque<ResourceSnapshot>>,
    alerts: AlertTracker,
}

/// Samples host resources and tracks threshold alerts
#[derive(Debug)]
pub struct ResourceMonitor {
    source: SharedMetricsSource,
    config: MonitoringConfig,
    state: RwLock<MonitorState>,
    alert_tx: broadcast::Sender<AlertEvent>,
}

impl ResourceMonitor {
    pub fn new(
        source: SharedMetricsSource,
        config: MonitoringConfig,
        alert_tx: broadcast::Sender<AlertEvent>,
    ) -> Self {
        let alerts = AlertTracker::new(config.resolve_ratio, config.alert_history_size);
        Self {
            source,
            config,
            state: RwLock::new(MonitorState {
                history: HashMap::new(),
                alerts,
            }),
            alert_tx,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    /// Take one sample of every resource and evaluate alerts
    ///
    /// A failed read leaves the history untouched.
    #[instrument(skip(self))]
    pub async fn sample(&self) -> ScalingResult<Vec<ResourceSnapshot>> {
        let readings = read_shared(&self.source)?;
        Ok(self.record_readings(readings, Utc::now()).await)
    }

    /// Record a reading taken at `at`
    pub async fn record_readings(
        &self,
        readings: SystemReadings,
        at: DateTime<Utc>,
    ) -> Vec<ResourceSnapshot> {
        let network_capacity = self.config.network_capacity_bytes_per_sec as f64;
        let network_percent = if network_capacity > 0.0 {
            (readings.network_bytes_per_sec / network_capacity * 100.0).min(100.0)
        } else {
            0.0
        };

        let samples = [
            (
                ResourceType::Cpu,
                readings.cpu_percent,
                100.0,
                (100.0 - readings.cpu_percent).max(0.0),
            ),
            (
                ResourceType::Memory,
                readings.memory_percent(),
                readings.memory_total as f64,
                readings.memory_available as f64,
            ),
            (
                ResourceType::Disk,
                readings.disk_percent(),
                readings.disk_total as f64,
                readings.disk_available as f64,
            ),
            (
                ResourceType::Network,
                network_percent,
                network_capacity,
                (network_capacity - readings.network_bytes_per_sec).max(0.0),
            ),
        ];

        let window = self.config.history_size.max(1);
        let mut state = self.state.write().await;
        let mut snapshots = Vec::with_capacity(samples.len());
        let mut events = vec![];

        for (resource_type, usage, total, available) in samples {
            let history = state.history.entry(resource_type).or_default();
            // make room first so the aggregates cover exactly the window
            while history.len() >= window {
                history.pop_front();
            }
            let count = history.len() as f64 + 1.0;
            let sum: f64 = history.iter().map(|s| s.current_usage).sum::<f64>() + usage;
            let peak = history
                .iter()
                .map(|s| s.current_usage)
                .fold(usage, f64::max);

            let snapshot = ResourceSnapshot {
                resource_type,
                timestamp: at,
                current_usage: usage,
                average_usage: sum / count,
                peak_usage: peak,
                total_capacity: total,
                available_capacity: available,
            };

            history.push_back(snapshot);
            snapshots.push(snapshot);

            let Some(thresholds) = self.thresholds_for(resource_type) else {
                continue;
            };
            let transitions = state.alerts.evaluate(
                resource_type.as_str(),
                resource_type,
                usage,
                &thresholds,
                at,
            );
            events.extend(transitions.into_iter().map(|t| t.into_event()));
        }
        drop(state);

        trace!(
            "sampled cpu {:.1}% memory {:.1}%",
            readings.cpu_percent,
            readings.memory_percent()
        );

        for event in events {
            // no subscribers is fine
            let _ = self.alert_tx.send(event);
        }

        snapshots
    }

    fn thresholds_for(&self, resource_type: ResourceType) -> Option<Thresholds> {
        let thresholds = &self.config.thresholds;
        match resource_type {
            ResourceType::Cpu => Some(thresholds.cpu),
            ResourceType::Memory => Some(thresholds.memory),
            ResourceType::Disk => Some(thresholds.disk),
            ResourceType::Network => thresholds.network,
        }
    }

    /// Snapshots of one resource recorded within the last `window`
    pub async fn get_recent(
        &self,
        resource_type: ResourceType,
        window: Duration,
    ) -> Vec<ResourceSnapshot> {
        let cutoff = TimeDelta::from_std(window)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta));

        let state = self.state.read().await;
        state
            .history
            .get(&resource_type)
            .map(|history| {
                history
                    .iter()
                    .filter(|s| cutoff.is_none_or(|cutoff| s.timestamp >= cutoff))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent `count` snapshots of one resource, oldest first
    pub async fn last_samples(
        &self,
        resource_type: ResourceType,
        count: usize,
    ) -> Vec<ResourceSnapshot> {
        let state = self.state.read().await;
        state
            .history
            .get(&resource_type)
            .map(|history| {
                let skip = history.len().saturating_sub(count);
                history.iter().skip(skip).copied().collect()
            })
            .unwrap_or_default()
    }

    pub async fn latest(&self, resource_type: ResourceType) -> Option<ResourceSnapshot> {
        let state = self.state.read().await;
        state
            .history
            .get(&resource_type)
            .and_then(|history| history.back().copied())
    }

    /// Latest known usage of every resource
    pub async fn current_load(&self) -> SystemLoad {
        let state = self.state.read().await;
        let latest = |resource_type: ResourceType| {
            state
                .history
                .get(&resource_type)
                .and_then(|history| history.back().copied())
        };

        let cpu = latest(ResourceType::Cpu);
        SystemLoad {
            cpu: cpu.map(|s| s.current_usage).unwrap_or(0.0),
            memory: latest(ResourceType::Memory)
                .map(|s| s.current_usage)
                .unwrap_or(0.0),
            disk: latest(ResourceType::Disk)
                .map(|s| s.current_usage)
                .unwrap_or(0.0),
            network: latest(ResourceType::Network)
                .map(|s| s.current_usage)
                .unwrap_or(0.0),
            timestamp: cpu.map(|s| s.timestamp),
        }
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.state.read().await.alerts.open_alerts()
    }

    pub async fn alert_history(&self) -> Vec<Alert> {
        self.state.read().await.alerts.history()
    }

    /// Sample on the configured interval until shutdown
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(
            "starting resource monitor with interval {:?}",
            self.config.interval()
        );
        let mut ticker = tokio::time::interval(self.config.interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample().await {
                        warn!("skipping resource sample: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("resource monitor received shutdown");
                    break;
                }
            }
        }
    }
}
