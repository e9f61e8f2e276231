//! Storage monitoring, retention and notification delivery end to end

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use resource_scaler::actors::messages::AlertEvent;
use resource_scaler::actors::notifier::NotifierHandle;
use resource_scaler::alerts::{AlertLevel, AlertManager};
use resource_scaler::config::{AlertTarget, RetentionConfig, StorageAlertingConfig, Webhook};
use resource_scaler::storage::{
    CleanupTrigger, MemoryBackend, NoticeKind, RetentionAction, RetentionPolicy, RetentionRule,
    ScriptedDiskProbe, StorageAlertingService, StorageBackend, StorageUsage,
};
use tokio::sync::broadcast;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn memory_backend() -> Arc<dyn StorageBackend> {
    Arc::new(MemoryBackend::new())
}

fn notifier_for(server: &MockServer, alert_tx: &broadcast::Sender<AlertEvent>) -> NotifierHandle {
    let manager = AlertManager::new(
        AlertTarget::Webhook(Webhook {
            url: format!("{}/hook", server.uri()),
        }),
        "integration",
    );
    NotifierHandle::spawn(manager, alert_tx.subscribe())
}

async fn wait_for_deliveries(handle: &NotifierHandle, expected: u64) -> u64 {
    let delivered = wait_until(Duration::from_secs(5), || async move {
        handle
            .get_stats()
            .await
            .is_some_and(|stats| stats.delivered >= expected)
    })
    .await;
    assert!(delivered, "expected {expected} deliveries");
    handle.get_stats().await.map_or(0, |stats| stats.delivered)
}

#[tokio::test]
async fn test_old_exports_are_archived_after_dry_run() {
    let data = tempfile::tempdir().unwrap();
    let archive = tempfile::tempdir().unwrap();
    let old = data.path().join("exports/old.csv");
    let recent = data.path().join("exports/new.csv");
    write_aged(&old, b"id,value\n1,2\n", 100);
    write_aged(&recent, b"id,value\n", 10);

    let probe = ScriptedDiskProbe::new();
    probe.set(data.path(), 100 * GB, 50 * GB);
    let retention = RetentionConfig {
        archive_dir: archive.path().to_path_buf(),
        policies: vec![
            RetentionPolicy::new(
                "exports",
                vec![RetentionRule::new(
                    "old exports",
                    "**/*.csv",
                    90,
                    RetentionAction::Archive,
                )],
            )
            .for_data_type("exports"),
        ],
        ..Default::default()
    };
    let backend = memory_backend();
    let (monitor, _alert_tx) = create_storage_monitor(
        vec![monitored(data.path(), "exports")],
        &probe,
        retention,
        backend.clone(),
    );

    // no alert at 50%, so nothing is cleaned up automatically
    monitor.check_all().await;
    assert!(monitor.active_alerts().await.is_empty());
    assert!(old.exists());

    let manager = monitor.retention();
    let recommendations = manager
        .analyze_scoped(data.path(), Some("integration"), Some("exports"))
        .await
        .unwrap();
    assert_eq!(recommendations.len(), 1);
    assert_eq!(recommendations[0].action, RetentionAction::Archive);

    let preview = manager.execute_cleanup(&recommendations, true).await;
    assert!(preview.dry_run);
    assert_eq!(preview.files_archived, 1);
    assert!(old.exists());

    let result = manager.execute_cleanup(&recommendations, false).await;
    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.files_archived, 1);
    assert!(!old.exists());
    assert!(recent.exists());

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let archived = archive.path().join(&day).join("old.csv");
    assert_eq!(fs::read(&archived).unwrap(), b"id,value\n1,2\n");
    assert!(archive.path().join(&day).join("old.csv.sha256").exists());

    let runs = backend.query_cleanup_history(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(!runs[0].dry_run);
    assert!(runs[1].dry_run);
    assert!(runs.iter().all(|run| run.trigger == CleanupTrigger::Manual));
}

#[tokio::test]
async fn test_critical_disk_alert_cleans_up_and_notifies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("critical alert"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let data = tempfile::tempdir().unwrap();
    let archive = tempfile::tempdir().unwrap();
    let stale = data.path().join("scratch/stale.tmp");
    let fresh = data.path().join("scratch/fresh.tmp");
    write_aged(&stale, b"stale", 10);
    write_aged(&fresh, b"fresh", 1);

    let probe = ScriptedDiskProbe::new();
    probe.set(data.path(), 100 * GB, 8 * GB);
    let retention = RetentionConfig {
        archive_dir: archive.path().to_path_buf(),
        policies: vec![
            RetentionPolicy::new(
                "scratch",
                vec![RetentionRule::new(
                    "stale tmp",
                    "*.tmp",
                    7,
                    RetentionAction::Delete,
                )],
            )
            .for_data_type("scratch"),
        ],
        ..Default::default()
    };
    let backend = memory_backend();
    let (monitor, alert_tx) = create_storage_monitor(
        vec![monitored(data.path(), "scratch")],
        &probe,
        retention,
        backend.clone(),
    );
    let notifier = notifier_for(&server, &alert_tx);

    monitor.check_all().await;

    // warning and critical open at 92%
    let levels: Vec<AlertLevel> = monitor
        .active_alerts()
        .await
        .iter()
        .map(|alert| alert.level)
        .collect();
    assert_eq!(levels, vec![AlertLevel::Warning, AlertLevel::Critical]);
    assert!(!stale.exists());
    assert!(fresh.exists());

    let runs = backend.query_cleanup_history(10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, CleanupTrigger::Alert);
    assert_eq!(runs[0].result.files_deleted, 1);

    assert_eq!(wait_for_deliveries(&notifier, 2).await, 2);
    notifier.shutdown().await;
}

#[tokio::test]
async fn test_growth_projection_sends_notices() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("storage notice"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let data = tempfile::tempdir().unwrap();
    let probe = ScriptedDiskProbe::new();
    let (monitor, alert_tx) = create_storage_monitor(
        vec![monitored(data.path(), "uploads")],
        &probe,
        RetentionConfig::default(),
        memory_backend(),
    );
    let notifier = notifier_for(&server, &alert_tx);
    let service = StorageAlertingService::new(
        StorageAlertingConfig::default(),
        "integration",
        Arc::clone(&monitor),
        alert_tx.clone(),
    );

    // 3 GB per day on a 100 GB disk, 70 GB used today
    let monitored_path = data.path().display().to_string();
    let now = Utc::now();
    let rows = (0..=5)
        .map(|day| {
            let used = (55 + 3 * day as u64) * GB;
            StorageUsage::new(
                monitored_path.clone(),
                100 * GB,
                100 * GB - used,
                used,
                "uploads",
                None,
                now - TimeDelta::days(5 - day),
            )
        })
        .collect();
    monitor.record(rows).await;

    let growth = monitor.growth_analysis(&monitored_path).await.unwrap().unwrap();
    assert!((growth.days_until_full.unwrap() - 10.0).abs() < 1e-3);

    let notices = service.check_alerts().await;
    assert_eq!(notices.len(), 2);
    let full = notices
        .iter()
        .find(|notice| notice.kind == NoticeKind::FullSoon)
        .unwrap();
    assert_eq!(full.level, AlertLevel::Warning);
    assert!(full.message.contains("10.0 days"));
    assert!(
        notices
            .iter()
            .any(|notice| notice.kind == NoticeKind::FastGrowth)
    );

    // inside the cooldown nothing is sent again
    assert!(service.check_alerts().await.is_empty());

    assert_eq!(wait_for_deliveries(&notifier, 2).await, 2);

    let report = service.generate_report().await;
    assert_eq!(report.usage.len(), 1);
    assert_eq!(report.growth.len(), 1);
    assert_eq!(report.recent_notices.len(), 2);
    notifier.shutdown().await;
}
