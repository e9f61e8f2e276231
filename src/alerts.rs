//! Threshold alerts with hysteresis
//!
//! ## Alert State Machine
//!
//! For every `(subject, level)` pair at most one alert is open:
//!
//! ```text
//! no open alert:
//!   value <  threshold                 → ResourceEvaluation::Ok
//!   value >= threshold                 → ResourceEvaluation::StartsToExceed (open alert)
//!
//! open alert:
//!   value >= threshold * resolve_ratio → ResourceEvaluation::Exceeding (keep open)
//!   value <  threshold * resolve_ratio → ResourceEvaluation::BackToOk (resolve alert)
//! ```
//!
//! The gap between the opening and the resolving bound keeps alerts from
//! flapping when a value oscillates around its threshold.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::actors::messages::AlertEvent;
use crate::config::{AlertTarget, Thresholds, Webhook};
use crate::monitors::resources::ResourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertLevel {
    /// Levels that carry a threshold, lowest first
    pub const THRESHOLD_LEVELS: [AlertLevel; 3] = [
        AlertLevel::Warning,
        AlertLevel::Critical,
        AlertLevel::Emergency,
    ];
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
            AlertLevel::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// What the alert is about: a resource name or a monitored path
    pub subject: String,
    pub resource_type: ResourceType,
    pub level: AlertLevel,
    pub current_value: f64,
    pub threshold: f64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvaluation {
    Ok,
    Exceeding,
    StartsToExceed,
    BackToOk,
}

impl ResourceEvaluation {
    pub fn evaluate(
        value: f64,
        threshold: f64,
        resolve_ratio: f64,
        alert_open: bool,
    ) -> ResourceEvaluation {
        if !alert_open {
            if value >= threshold {
                return ResourceEvaluation::StartsToExceed;
            }
            return ResourceEvaluation::Ok;
        }

        // an open alert only clears once the value is clearly below the threshold
        if value < threshold * resolve_ratio {
            return ResourceEvaluation::BackToOk;
        }

        ResourceEvaluation::Exceeding
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Opened(Alert),
    Resolved(Alert),
}

impl AlertTransition {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertTransition::Opened(alert) | AlertTransition::Resolved(alert) => alert,
        }
    }

    pub fn into_event(self) -> AlertEvent {
        match self {
            AlertTransition::Opened(alert) => AlertEvent::Opened(alert),
            AlertTransition::Resolved(alert) => AlertEvent::Resolved(alert),
        }
    }
}

/// Open alerts plus a bounded history of openings and resolutions
#[derive(Debug, Clone)]
pub struct AlertTracker {
    open: HashMap<(String, AlertLevel), Alert>,
    history: VecDeque<Alert>,
    history_size: usize,
    resolve_ratio: f64,
    sequence: u64,
}

impl AlertTracker {
    pub fn new(resolve_ratio: f64, history_size: usize) -> Self {
        Self {
            open: HashMap::new(),
            history: VecDeque::with_capacity(history_size.min(1024)),
            history_size,
            resolve_ratio,
            sequence: 0,
        }
    }

    /// Evaluate one value against all threshold levels of a subject
    pub fn evaluate(
        &mut self,
        subject: &str,
        resource_type: ResourceType,
        value: f64,
        thresholds: &Thresholds,
        at: DateTime<Utc>,
    ) -> Vec<AlertTransition> {
        let mut transitions = vec![];

        for level in AlertLevel::THRESHOLD_LEVELS {
            let Some(threshold) = thresholds.for_level(level) else {
                continue;
            };
            let key = (subject.to_string(), level);
            let evaluation = ResourceEvaluation::evaluate(
                value,
                threshold,
                self.resolve_ratio,
                self.open.contains_key(&key),
            );

            match evaluation {
                ResourceEvaluation::Ok | ResourceEvaluation::Exceeding => {
                    if let Some(alert) = self.open.get_mut(&key) {
                        alert.current_value = value;
                    }
                }
                ResourceEvaluation::StartsToExceed => {
                    self.sequence += 1;
                    let alert = Alert {
                        id: format!("{subject}-{level}-{}", self.sequence),
                        subject: subject.to_string(),
                        resource_type,
                        level,
                        current_value: value,
                        threshold,
                        message: format!(
                            "{subject} at {value:.1}% reached {level} threshold {threshold:.1}%"
                        ),
                        created_at: at,
                        resolved_at: None,
                    };
                    warn!("alert opened: {}", alert.message);
                    self.push_history(alert.clone());
                    self.open.insert(key, alert.clone());
                    transitions.push(AlertTransition::Opened(alert));
                }
                ResourceEvaluation::BackToOk => {
                    if let Some(mut alert) = self.open.remove(&key) {
                        alert.current_value = value;
                        alert.resolved_at = Some(at);
                        info!(
                            "alert resolved: {subject} {level} ({value:.1}% < {:.1}%)",
                            threshold * self.resolve_ratio
                        );
                        self.push_history(alert.clone());
                        transitions.push(AlertTransition::Resolved(alert));
                    }
                }
            }
        }

        transitions
    }

    fn push_history(&mut self, alert: Alert) {
        self.history.push_back(alert);
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
    }

    pub fn open_alert(&self, subject: &str, level: AlertLevel) -> Option<&Alert> {
        self.open.get(&(subject.to_string(), level))
    }

    /// Open alerts, oldest first
    pub fn open_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.open.values().cloned().collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.level.cmp(&b.level)));
        alerts
    }

    pub fn history(&self) -> Vec<Alert> {
        self.history.iter().cloned().collect()
    }

    /// Highest open level for a subject
    pub fn highest_open_level(&self, subject: &str) -> Option<AlertLevel> {
        self.open
            .keys()
            .filter(|(s, _)| s == subject)
            .map(|(_, level)| *level)
            .max()
    }
}

/// Delivers alert events to the configured target
#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    target: AlertTarget,
    instance_name: String,
}

impl AlertManager {
    pub fn new(target: AlertTarget, instance_name: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            target,
            instance_name: instance_name.into(),
        }
    }

    #[instrument(skip(self, event))]
    pub async fn send_alert(&self, event: &AlertEvent) -> anyhow::Result<()> {
        match &self.target {
            AlertTarget::Webhook(webhook) => {
                let message = self.format_message(event);
                self.send_webhook_alert(webhook, event, &message).await
            }
        }
    }

    pub fn format_message(&self, event: &AlertEvent) -> String {
        let instance = &self.instance_name;
        match event {
            AlertEvent::Opened(alert) => format!(
                "🚨 [{instance}] {} alert: {}",
                alert.level, alert.message
            ),
            AlertEvent::Resolved(alert) => format!(
                "✅ [{instance}] {} alert resolved: {} back at {:.1}%",
                alert.level, alert.subject, alert.current_value
            ),
            AlertEvent::Notice(notice) => format!(
                "📦 [{instance}] {} storage notice for {}: {}",
                notice.level, notice.path, notice.message
            ),
        }
    }

    async fn send_webhook_alert(
        &self,
        webhook: &Webhook,
        event: &AlertEvent,
        message: &str,
    ) -> anyhow::Result<()> {
        let payload = json!({
            "instance": self.instance_name,
            "message": message,
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("webhook alert delivered");
                Ok(())
            }
            Ok(response) => {
                error!("webhook responded with {}", response.status());
                anyhow::bail!("webhook responded with {}", response.status())
            }
            Err(e) => {
                error!("failed to send webhook alert: {e}");
                Err(e.into())
            }
        }
    }
}
