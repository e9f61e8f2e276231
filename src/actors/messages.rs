//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to a specific actor via mpsc
//! 2. **Events**: Broadcast notifications published to every subscriber
//! 3. **Immutability**: All events are cloneable for multi-subscriber patterns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::alerts::Alert;
use crate::scaling::ScalabilityMode;
use crate::storage::alerting::StorageNotice;

/// Event published whenever an alert changes state
///
/// Published by the resource monitor, the storage monitor and the storage
/// alerting service. Slow subscribers may lag and drop events; the alert
/// history keeps the authoritative record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "alert", rename_all = "snake_case")]
pub enum AlertEvent {
    Opened(Alert),
    Resolved(Alert),

    /// Growth based storage warning that has no open/resolve lifecycle
    Notice(StorageNotice),
}

/// Event published by the scalability manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingEvent {
    ModeChanged {
        from: ScalabilityMode,
        to: ScalabilityMode,
        at: DateTime<Utc>,
    },

    WorkersScaled {
        from: usize,
        to: usize,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Delivery counters of the notifier actor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifierStats {
    pub delivered: u64,
    pub failed: u64,
    /// Events dropped while muted
    pub muted: u64,
    /// Events lost because the notifier lagged behind the broadcast channel
    pub lagged: u64,
}

/// Commands that can be sent to the NotifierActor
#[derive(Debug)]
pub enum NotifierCommand {
    /// Stop delivering notifications (maintenance windows)
    Mute,

    Unmute,

    GetStats {
        respond_to: oneshot::Sender<NotifierStats>,
    },

    /// Gracefully shut down the notifier
    Shutdown,
}
