//! SQLite storage history backend
//!
//! - **Embedded**: no separate database server required
//! - **WAL mode**: reads proceed while the monitor writes
//! - **Migrations**: schema versioned with sqlx under `migrations/`
//!
//! Timestamps are stored as Unix milliseconds.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend, UsageQuery};
use super::error::{StorageError, StorageResult};
use super::schema::{CleanupRecord, CleanupTrigger, StorageUsage};

pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database at `db_path` and run migrations
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn usage_from_row(row: &SqliteRow) -> StorageUsage {
        StorageUsage {
            path: row.get("path"),
            total_bytes: row.get::<i64, _>("total_bytes") as u64,
            used_bytes: row.get::<i64, _>("used_bytes") as u64,
            free_bytes: row.get::<i64, _>("free_bytes") as u64,
            directory_bytes: row.get::<i64, _>("directory_bytes") as u64,
            usage_percentage: row.get("usage_percentage"),
            data_type: row.get("data_type"),
            instance_name: row.get("instance_name"),
            timestamp: Self::millis_to_timestamp(row.get("timestamp")),
        }
    }

    fn cleanup_from_row(row: &SqliteRow) -> StorageResult<CleanupRecord> {
        let result_json: String = row.get("result");
        let result = serde_json::from_str(&result_json).map_err(|e| {
            StorageError::Serialization(format!("failed to deserialize cleanup result: {}", e))
        })?;
        let trigger: String = row.get("cleanup_trigger");

        Ok(CleanupRecord {
            started_at: Self::millis_to_timestamp(row.get("started_at")),
            trigger: trigger.parse().unwrap_or(CleanupTrigger::Manual),
            dry_run: row.get::<i64, _>("dry_run") != 0,
            files_processed: row.get::<i64, _>("files_processed") as usize,
            bytes_freed: row.get::<i64, _>("bytes_freed") as u64,
            error_count: row.get::<i64, _>("error_count") as usize,
            result,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn insert_usage_batch(&self, rows: Vec<StorageUsage>) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for usage in rows {
            sqlx::query(
                r#"
                INSERT INTO storage_usage (
                    path, timestamp, total_bytes, used_bytes, free_bytes,
                    directory_bytes, usage_percentage, data_type, instance_name
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (path, timestamp) DO UPDATE SET
                    total_bytes = excluded.total_bytes,
                    used_bytes = excluded.used_bytes,
                    free_bytes = excluded.free_bytes,
                    directory_bytes = excluded.directory_bytes,
                    usage_percentage = excluded.usage_percentage,
                    data_type = excluded.data_type,
                    instance_name = excluded.instance_name
                "#,
            )
            .bind(&usage.path)
            .bind(Self::timestamp_to_millis(&usage.timestamp))
            .bind(usage.total_bytes as i64)
            .bind(usage.used_bytes as i64)
            .bind(usage.free_bytes as i64)
            .bind(usage.directory_bytes as i64)
            .bind(usage.usage_percentage)
            .bind(&usage.data_type)
            .bind(&usage.instance_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!("usage batch insert complete");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %query.path))]
    async fn query_usage_range(&self, query: UsageQuery) -> StorageResult<Vec<StorageUsage>> {
        let limit_clause = query
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let sql = format!(
            r#"
            SELECT path, timestamp, total_bytes, used_bytes, free_bytes,
                   directory_bytes, usage_percentage, data_type, instance_name
            FROM storage_usage
            WHERE path = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            {}
            "#,
            limit_clause
        );

        let rows = sqlx::query(&sql)
            .bind(&query.path)
            .bind(Self::timestamp_to_millis(&query.start))
            .bind(Self::timestamp_to_millis(&query.end))
            .fetch_all(&self.pool)
            .await?;

        let results: Vec<StorageUsage> = rows.iter().map(Self::usage_from_row).collect();
        debug!("query returned {} usage rows", results.len());
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn query_latest_usage(
        &self,
        path: &str,
        limit: usize,
    ) -> StorageResult<Vec<StorageUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT path, timestamp, total_bytes, used_bytes, free_bytes,
                   directory_bytes, usage_percentage, data_type, instance_name
            FROM storage_usage
            WHERE path = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(path)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::usage_from_row).collect())
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_usage(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM storage_usage WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old usage rows", deleted);

        Ok(deleted)
    }

    #[instrument(skip(self, record), fields(trigger = %record.trigger))]
    async fn record_cleanup(&self, record: CleanupRecord) -> StorageResult<()> {
        let result_json = serde_json::to_string(&record.result).map_err(|e| {
            StorageError::Serialization(format!("failed to serialize cleanup result: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO cleanup_history (
                started_at, cleanup_trigger, dry_run, files_processed,
                bytes_freed, error_count, result
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::timestamp_to_millis(&record.started_at))
        .bind(record.trigger.to_string())
        .bind(record.dry_run as i64)
        .bind(record.files_processed as i64)
        .bind(record.bytes_freed as i64)
        .bind(record.error_count as i64)
        .bind(result_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_cleanup_history(&self, limit: usize) -> StorageResult<Vec<CleanupRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT started_at, cleanup_trigger, dry_run, files_processed,
                   bytes_freed, error_count, result
            FROM cleanup_history
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::cleanup_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let usage_rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM storage_usage")
            .fetch_one(&self.pool)
            .await?;
        let cleanup_rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cleanup_history")
            .fetch_one(&self.pool)
            .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(format!(
            "SQLite: {} usage rows, {} cleanup runs, {} on disk",
            usage_rows.0,
            cleanup_rows.0,
            crate::util::format_bytes(file_size)
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
