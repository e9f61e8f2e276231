//! Storage history backend trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use super::schema::{CleanupRecord, StorageUsage};

/// Query parameters for fetching usage rows within a time range
#[derive(Debug, Clone)]
pub struct UsageQuery {
    /// Monitored path to query
    pub path: String,

    /// Start of time range (inclusive)
    pub start: DateTime<Utc>,

    /// End of time range (inclusive)
    pub end: DateTime<Utc>,

    /// Maximum number of results to return
    pub limit: Option<usize>,
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Persistent history of storage usage and cleanup runs
///
/// Implementations must be `Send + Sync`; the storage monitor, the retention
/// manager and the alerting service share one backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert a batch of usage rows
    ///
    /// A second row for the same `(path, timestamp)` replaces the first.
    async fn insert_usage_batch(&self, rows: Vec<StorageUsage>) -> StorageResult<()>;

    /// Usage rows of one path within a time range, oldest first
    async fn query_usage_range(&self, query: UsageQuery) -> StorageResult<Vec<StorageUsage>>;

    /// The `limit` most recent usage rows of one path, newest first
    async fn query_latest_usage(&self, path: &str, limit: usize)
    -> StorageResult<Vec<StorageUsage>>;

    /// Delete usage rows older than `before`, returning how many were deleted
    async fn cleanup_old_usage(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    async fn record_cleanup(&self, record: CleanupRecord) -> StorageResult<()>;

    /// The `limit` most recent cleanup runs, newest first
    async fn query_cleanup_history(&self, limit: usize) -> StorageResult<Vec<CleanupRecord>>;

    /// Lightweight check that the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable statistics (e.g. "SQLite: 1200 usage rows, 450 KB on disk")
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
