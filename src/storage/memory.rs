//! In-memory storage history (no persistence)
//!
//! Used when the configured backend is `none` and in tests. Each path keeps
//! a bounded buffer of rows; the oldest rows are evicted first.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend, UsageQuery};
use super::error::StorageResult;
use super::schema::{CleanupRecord, StorageUsage};

/// Maximum usage rows kept in memory per path
const MAX_ROWS_PER_PATH: usize = 10_000;

/// Maximum cleanup runs kept in memory
const MAX_CLEANUP_RECORDS: usize = 1_000;

#[derive(Debug, Default)]
struct MemoryState {
    /// Rows grouped by path, sorted by timestamp
    usage: HashMap<String, VecDeque<StorageUsage>>,
    cleanups: VecDeque<CleanupRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert_usage_batch(&self, rows: Vec<StorageUsage>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        for row in rows {
            let buffer = state.usage.entry(row.path.clone()).or_default();
            match buffer.binary_search_by(|r| r.timestamp.cmp(&row.timestamp)) {
                Ok(index) => buffer[index] = row,
                Err(index) => buffer.insert(index, row),
            }
            while buffer.len() > MAX_ROWS_PER_PATH {
                buffer.pop_front();
            }
        }
        Ok(())
    }

    async fn query_usage_range(&self, query: UsageQuery) -> StorageResult<Vec<StorageUsage>> {
        debug!("querying in-memory usage history for {}", query.path);

        let state = self.state.read().await;
        let rows = state
            .usage
            .get(&query.path)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|r| r.timestamp >= query.start && r.timestamp <= query.end)
                    .take(query.limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(rows)
    }

    async fn query_latest_usage(
        &self,
        path: &str,
        limit: usize,
    ) -> StorageResult<Vec<StorageUsage>> {
        let state = self.state.read().await;
        Ok(state
            .usage
            .get(path)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn cleanup_old_usage(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let mut deleted = 0;
        for buffer in state.usage.values_mut() {
            let len = buffer.len();
            buffer.retain(|r| r.timestamp >= before);
            deleted += len - buffer.len();
        }
        state.usage.retain(|_, buffer| !buffer.is_empty());
        Ok(deleted)
    }

    async fn record_cleanup(&self, record: CleanupRecord) -> StorageResult<()> {
        let mut state = self.state.write().await;
        state.cleanups.push_back(record);
        while state.cleanups.len() > MAX_CLEANUP_RECORDS {
            state.cleanups.pop_front();
        }
        Ok(())
    }

    async fn query_cleanup_history(&self, limit: usize) -> StorageResult<Vec<CleanupRecord>> {
        let state = self.state.read().await;
        Ok(state.cleanups.iter().rev().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "in-memory storage operational".to_string(),
            metadata: HashMap::new(),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let state = self.state.read().await;
        let rows: usize = state.usage.values().map(VecDeque::len).sum();
        Ok(format!(
            "in-memory: {} usage rows across {} paths, {} cleanup runs",
            rows,
            state.usage.len(),
            state.cleanups.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
