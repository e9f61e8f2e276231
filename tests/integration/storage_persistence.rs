//! Storage history persisted in SQLite across restarts

use chrono::{TimeDelta, Utc};
use resource_scaler::config::{RetentionConfig, StorageBackendConfig};
use resource_scaler::storage::{
    CleanupTrigger, RetentionAction, RetentionPolicy, RetentionRule, ScriptedDiskProbe,
    StorageUsage, create_backend,
};
use tokio_test::assert_ok;

use crate::helpers::*;

fn sqlite_config(path: std::path::PathBuf) -> StorageBackendConfig {
    StorageBackendConfig::Sqlite {
        path,
        retention_days: 30,
    }
}

#[tokio::test]
async fn test_usage_and_cleanup_history_survive_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let archive = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("history.db");
    write_aged(&data.path().join("logs/app.log"), b"old log line\n", 40);

    let probe = ScriptedDiskProbe::new();
    probe.set(data.path(), 100 * GB, 60 * GB);
    let retention = RetentionConfig {
        archive_dir: archive.path().to_path_buf(),
        policies: vec![RetentionPolicy::new(
            "logs",
            vec![RetentionRule::new(
                "old logs",
                "*.log",
                30,
                RetentionAction::Delete,
            )],
        )],
        ..Default::default()
    };

    {
        let backend = create_backend(&sqlite_config(db_path.clone()))
            .await
            .unwrap();
        let (monitor, _alert_tx) = create_storage_monitor(
            vec![monitored(data.path(), "logs")],
            &probe,
            retention,
            backend.clone(),
        );

        monitor.check_all().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        probe.set(data.path(), 100 * GB, 55 * GB);
        monitor.check_all().await;

        let manager = monitor.retention();
        let recommendations = manager.analyze_directory(data.path()).await.unwrap();
        assert_eq!(recommendations.len(), 1);
        let result = manager.execute_cleanup(&recommendations, false).await;
        assert_eq!(result.files_deleted, 1);

        backend.close().await.unwrap();
    }

    let reopened = create_backend(&sqlite_config(db_path)).await.unwrap();
    let path = data.path().display().to_string();

    let usage = reopened.query_latest_usage(&path, 10).await.unwrap();
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].free_bytes, 55 * GB);
    assert_eq!(usage[1].free_bytes, 60 * GB);
    assert_eq!(usage[0].data_type, "logs");
    assert_eq!(usage[0].instance_name.as_deref(), Some("integration"));

    let runs = reopened.query_cleanup_history(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, CleanupTrigger::Manual);
    assert_eq!(runs[0].files_processed, 1);
    assert!(runs[0].bytes_freed > 0);
    let health = assert_ok!(reopened.health_check().await);
    assert!(health.healthy);
}

#[tokio::test]
async fn test_prune_drops_rows_beyond_retention() {
    let temp_dir = tempfile::tempdir().unwrap();
    let backend = create_backend(&sqlite_config(temp_dir.path().join("history.db")))
        .await
        .unwrap();
    let probe = ScriptedDiskProbe::new();
    let (monitor, _alert_tx) =
        create_storage_monitor(vec![], &probe, RetentionConfig::default(), backend.clone());

    let now = Utc::now();
    let rows = [45, 31, 10, 0]
        .into_iter()
        .map(|days_ago| {
            StorageUsage::new(
                "/srv/data",
                100 * GB,
                50 * GB,
                0,
                "general",
                None,
                now - TimeDelta::days(days_ago),
            )
        })
        .collect();
    monitor.record(rows).await;

    assert_eq!(assert_ok!(monitor.prune_history(30).await), 2);
    let remaining = backend.query_latest_usage("/srv/data", 10).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(
        remaining
            .iter()
            .all(|usage| now - usage.timestamp < TimeDelta::days(30))
    );
}
