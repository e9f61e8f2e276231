//! Storage history row definitions
//!
//! Usage rows are flat: one per monitored path per sampling tick. Cleanup
//! rows keep the counters that reports aggregate on as columns and the full
//! [`CleanupResult`] (including per-file errors) as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::retention::CleanupResult;

/// Disk usage of one monitored path at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub path: String,

    /// Capacity of the filesystem holding the path
    pub total_bytes: u64,

    /// Bytes in use on that filesystem
    pub used_bytes: u64,

    pub free_bytes: u64,

    /// Bytes below the monitored path itself
    pub directory_bytes: u64,

    /// `used / total` in percent
    pub usage_percentage: f64,

    pub data_type: String,

    pub instance_name: Option<String>,

    /// When the sample was taken (always UTC)
    pub timestamp: DateTime<Utc>,
}

impl StorageUsage {
    pub fn new(
        path: impl Into<String>,
        total_bytes: u64,
        free_bytes: u64,
        directory_bytes: u64,
        data_type: impl Into<String>,
        instance_name: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let free_bytes = free_bytes.min(total_bytes);
        let used_bytes = total_bytes - free_bytes;
        let usage_percentage = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };

        Self {
            path: path.into(),
            total_bytes,
            used_bytes,
            free_bytes,
            directory_bytes,
            usage_percentage,
            data_type: data_type.into(),
            instance_name,
            timestamp,
        }
    }
}

/// What started a cleanup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTrigger {
    /// Called through the public API
    Manual,

    /// Started by the storage monitor on an alert
    Alert,
}

impl std::fmt::Display for CleanupTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupTrigger::Manual => write!(f, "manual"),
            CleanupTrigger::Alert => write!(f, "alert"),
        }
    }
}

impl std::str::FromStr for CleanupTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(CleanupTrigger::Manual),
            "alert" => Ok(CleanupTrigger::Alert),
            _ => Err(format!("unknown cleanup trigger: {}", s)),
        }
    }
}

/// One executed cleanup batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub started_at: DateTime<Utc>,
    pub trigger: CleanupTrigger,
    pub dry_run: bool,
    pub files_processed: usize,
    pub bytes_freed: u64,
    pub error_count: usize,

    /// Complete outcome, serialized to JSON when written to a database
    pub result: CleanupResult,
}

impl CleanupRecord {
    pub fn from_result(result: &CleanupResult, trigger: CleanupTrigger) -> Self {
        Self {
            started_at: result.started_at,
            trigger,
            dry_run: result.dry_run,
            files_processed: result.files_processed,
            bytes_freed: result.bytes_freed,
            error_count: result.errors.len(),
            result: result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percentage_from_free_space() {
        let usage = StorageUsage::new("/data", 200, 50, 10, "general", None, Utc::now());
        assert_eq!(usage.used_bytes, 150);
        assert!((usage.usage_percentage - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_filesystem_reports_zero_usage() {
        let usage = StorageUsage::new("/data", 0, 0, 0, "general", None, Utc::now());
        assert_eq!(usage.usage_percentage, 0.0);
    }

    #[test]
    fn test_cleanup_trigger_parsing() {
        assert_eq!("alert".parse::<CleanupTrigger>(), Ok(CleanupTrigger::Alert));
        assert!("cron".parse::<CleanupTrigger>().is_err());
        assert_eq!(CleanupTrigger::Manual.to_string(), "manual");
    }
}
