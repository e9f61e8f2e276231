//! Storage notices with per-id cooldown and periodic utilization reports

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::actors::messages::AlertEvent;
use crate::alerts::{Alert, AlertLevel};
use crate::config::StorageAlertingConfig;

use super::monitor::{GrowthAnalysis, StorageMonitor};
use super::retention::CleanupRecommendation;
use super::schema::{CleanupRecord, StorageUsage};

/// Below this many days until full a projection is critical
const CRITICAL_DAYS_UNTIL_FULL: f64 = 7.0;

const REPORT_CLEANUP_HISTORY: usize = 10;
const REPORT_RECOMMENDATIONS: usize = 50;
const NOTICE_HISTORY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Reminder of an alert that is still open
    ActiveAlert,
    /// Projected to run out of space soon
    FullSoon,
    /// Growing faster than the configured share of capacity per day
    FastGrowth,
}

/// One delivered storage notice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNotice {
    /// Stable across repeats; the cooldown is keyed on it
    pub id: String,
    pub path: String,
    pub kind: NoticeKind,
    pub level: AlertLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageBreakdown {
    pub paths: usize,
    pub directory_bytes: u64,
    pub average_usage_percentage: f64,
}

impl UsageBreakdown {
    fn add(&mut self, usage: &StorageUsage) {
        let total = self.average_usage_percentage * self.paths as f64 + usage.usage_percentage;
        self.paths += 1;
        self.directory_bytes += usage.directory_bytes;
        self.average_usage_percentage = total / self.paths as f64;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageUtilizationReport {
    pub generated_at: DateTime<Utc>,
    pub instance_name: String,
    pub usage: Vec<StorageUsage>,
    pub total_directory_bytes: u64,
    pub by_instance: BTreeMap<String, UsageBreakdown>,
    pub by_data_type: BTreeMap<String, UsageBreakdown>,
    pub growth: Vec<GrowthAnalysis>,
    pub active_alerts: Vec<Alert>,
    pub recent_notices: Vec<StorageNotice>,
    pub cleanup_history: Vec<CleanupRecord>,
    /// Highest priority first, then largest savings
    pub recommendations: Vec<CleanupRecommendation>,
    pub potential_savings_bytes: u64,
}

#[derive(Debug, Default)]
struct AlertingState {
    last_sent: HashMap<String, DateTime<Utc>>,
    notices: VecDeque<StorageNotice>,
    reports: VecDeque<StorageUtilizationReport>,
}

/// Turns storage monitor state into notices and reports
pub struct StorageAlertingService {
    config: StorageAlertingConfig,
    instance_name: String,
    monitor: Arc<StorageMonitor>,
    state: Mutex<AlertingState>,
    alert_tx: broadcast::Sender<AlertEvent>,
}

impl fmt::Debug for StorageAlertingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageAlertingService")
            .field("config", &self.config)
            .field("instance_name", &self.instance_name)
            .finish()
    }
}

impl StorageAlertingService {
    pub fn new(
        config: StorageAlertingConfig,
        instance_name: impl Into<String>,
        monitor: Arc<StorageMonitor>,
        alert_tx: broadcast::Sender<AlertEvent>,
    ) -> Self {
        Self {
            config,
            instance_name: instance_name.into(),
            monitor,
            state: Mutex::new(AlertingState::default()),
            alert_tx,
        }
    }

    pub async fn check_alerts(&self) -> Vec<StorageNotice> {
        self.check_alerts_at(Utc::now()).await
    }

    /// Collect open alerts and growth projections, deliver those out of cooldown
    #[instrument(skip(self))]
    pub async fn check_alerts_at(&self, now: DateTime<Utc>) -> Vec<StorageNotice> {
        let mut candidates: Vec<StorageNotice> = self
            .monitor
            .active_alerts()
            .await
            .into_iter()
            .map(|alert| StorageNotice {
                id: alert.id.clone(),
                path: alert.subject.clone(),
                kind: NoticeKind::ActiveAlert,
                level: alert.level,
                message: format!(
                    "{} (open since {})",
                    alert.message,
                    alert.created_at.format("%Y-%m-%d %H:%M UTC")
                ),
                created_at: now,
            })
            .collect();

        for monitored in &self.monitor.config().paths {
            let path = monitored.path.display().to_string();
            match self.monitor.growth_analysis(&path).await {
                Ok(Some(growth)) => candidates.extend(self.growth_notices(&growth, now)),
                Ok(None) => {}
                Err(e) => warn!("growth analysis of {path} failed: {e}"),
            }
        }

        let cooldown = TimeDelta::minutes(self.config.alert_cooldown_minutes);
        let mut state = self.state.lock().await;
        state.last_sent.retain(|_, sent| now - *sent < cooldown);

        let mut delivered = Vec::new();
        for notice in candidates {
            if state.last_sent.contains_key(&notice.id) {
                debug!("suppressing {} within cooldown", notice.id);
                continue;
            }
            state.last_sent.insert(notice.id.clone(), now);

            info!("storage notice [{}] {}", notice.level, notice.message);
            let _ = self.alert_tx.send(AlertEvent::Notice(notice.clone()));

            state.notices.push_back(notice.clone());
            while state.notices.len() > NOTICE_HISTORY {
                state.notices.pop_front();
            }
            delivered.push(notice);
        }

        delivered
    }

    fn growth_notices(&self, growth: &GrowthAnalysis, now: DateTime<Utc>) -> Vec<StorageNotice> {
        let mut notices = vec![];

        let full_soon = growth
            .days_until_full
            .filter(|days| *days <= self.config.full_within_days);
        if let Some(days) = full_soon {
            let level = if days < CRITICAL_DAYS_UNTIL_FULL {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            notices.push(StorageNotice {
                id: format!("{}-full-soon", growth.path),
                path: growth.path.clone(),
                kind: NoticeKind::FullSoon,
                level,
                message: format!(
                    "{} projected full in {:.1} days at {}/day",
                    growth.path,
                    days,
                    crate::util::format_bytes(growth.growth_bytes_per_day.max(0.0) as u64)
                ),
                created_at: now,
            });
        }

        if growth.growth_percent_per_day > self.config.growth_percent_per_day {
            notices.push(StorageNotice {
                id: format!("{}-fast-growth", growth.path),
                path: growth.path.clone(),
                kind: NoticeKind::FastGrowth,
                level: AlertLevel::Warning,
                message: format!(
                    "{} grows {:.2}% of capacity per day (limit {:.2}%)",
                    growth.path, growth.growth_percent_per_day, self.config.growth_percent_per_day
                ),
                created_at: now,
            });
        }

        notices
    }

    /// Build a report and keep it in the bounded report history
    #[instrument(skip(self))]
    pub async fn generate_report(&self) -> StorageUtilizationReport {
        let usage = self.monitor.latest_usage().await;

        let mut by_instance: BTreeMap<String, UsageBreakdown> = BTreeMap::new();
        let mut by_data_type: BTreeMap<String, UsageBreakdown> = BTreeMap::new();
        for row in &usage {
            let instance = row
                .instance_name
                .clone()
                .unwrap_or_else(|| self.instance_name.clone());
            by_instance.entry(instance).or_default().add(row);
            by_data_type.entry(row.data_type.clone()).or_default().add(row);
        }

        let mut growth = Vec::new();
        let mut recommendations = Vec::new();
        for monitored in &self.monitor.config().paths {
            let path = monitored.path.display().to_string();
            match self.monitor.growth_analysis(&path).await {
                Ok(Some(analysis)) => growth.push(analysis),
                Ok(None) => {}
                Err(e) => warn!("growth analysis of {path} failed: {e}"),
            }

            let instance = monitored
                .instance_name
                .as_deref()
                .unwrap_or(&self.instance_name);
            match self
                .monitor
                .retention()
                .analyze_scoped(&monitored.path, Some(instance), Some(&monitored.data_type))
                .await
            {
                Ok(recs) => recommendations.extend(recs),
                Err(e) => warn!("retention analysis of {path} failed: {e}"),
            }
        }
        recommendations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.estimated_savings.cmp(&a.estimated_savings))
        });
        recommendations.truncate(REPORT_RECOMMENDATIONS);
        let potential_savings_bytes = recommendations
            .iter()
            .filter(|r| r.safe_to_execute)
            .map(|r| r.estimated_savings)
            .sum();

        let cleanup_history = match self
            .monitor
            .backend()
            .query_cleanup_history(REPORT_CLEANUP_HISTORY)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!("failed to load cleanup history: {e}");
                Vec::new()
            }
        };

        let mut state = self.state.lock().await;
        let report = StorageUtilizationReport {
            generated_at: Utc::now(),
            instance_name: self.instance_name.clone(),
            total_directory_bytes: usage.iter().map(|u| u.directory_bytes).sum(),
            usage,
            by_instance,
            by_data_type,
            growth,
            active_alerts: self.monitor.active_alerts().await,
            recent_notices: state.notices.iter().cloned().collect(),
            cleanup_history,
            recommendations,
            potential_savings_bytes,
        };

        info!(
            "storage report: {} paths, {} active alerts, {} reclaimable",
            report.usage.len(),
            report.active_alerts.len(),
            crate::util::format_bytes(report.potential_savings_bytes)
        );

        state.reports.push_back(report.clone());
        while state.reports.len() > self.config.report_history_size {
            state.reports.pop_front();
        }
        report
    }

    /// Past reports, oldest first
    pub async fn reports(&self) -> Vec<StorageUtilizationReport> {
        self.state.lock().await.reports.iter().cloned().collect()
    }

    /// Recently delivered notices, oldest first
    pub async fn notices(&self) -> Vec<StorageNotice> {
        self.state.lock().await.notices.iter().cloned().collect()
    }

    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let check_every = Duration::from_secs(self.config.check_interval_secs.max(1));
        let report_every = Duration::from_secs(self.config.report_interval_hours.max(1) * 60 * 60);
        debug!("starting storage alerting, checks every {check_every:?}, reports every {report_every:?}");

        let mut check_ticker = tokio::time::interval(check_every);
        let mut report_ticker = tokio::time::interval(report_every);

        loop {
            tokio::select! {
                _ = check_ticker.tick() => {
                    self.check_alerts().await;
                }
                _ = report_ticker.tick() => {
                    self.generate_report().await;
                }
                _ = shutdown.changed() => {
                    debug!("storage alerting received shutdown");
                    break;
                }
            }
        }
    }
}
