//! Task processing through a fully wired instance

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use resource_scaler::config::{MonitoringConfig, ProcessingConfig, ScalingConfig};
use resource_scaler::monitors::source::SystemReadings;
use resource_scaler::processing::{TaskHandler, TaskSpec, TaskStatus};
use resource_scaler::{ScalingError, TaskError};
use serde_json::Value;

use crate::helpers::*;

fn sleeper(duration: Duration) -> TaskHandler {
    TaskHandler::from_async(move |_| async move {
        tokio::time::sleep(duration).await;
        Ok(Value::Null)
    })
}

#[tokio::test]
async fn test_twenty_tasks_never_exceed_concurrency_limit() {
    let stack = create_test_stack(
        MonitoringConfig::default(),
        ProcessingConfig {
            max_concurrent_tasks: 5,
            ..Default::default()
        },
        ScalingConfig::default(),
        2,
    );
    stack.processor.start().await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::new();
    for i in 0..20u64 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let handler = TaskHandler::from_async(move |payload| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(payload)
            }
        });
        let id = stack
            .processor
            .submit(TaskSpec::new("work", handler).with_payload(Value::from(i)))
            .await
            .unwrap();
        ids.push(id);
    }

    for (i, id) in ids.iter().enumerate() {
        let result = stack
            .processor
            .wait_for(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result, Value::from(i as u64));
    }

    // the limit is reached and never exceeded
    assert_eq!(peak.load(Ordering::SeqCst), 5);
    let stats = stack.processor.get_stats().await;
    assert_eq!(stats.completed, 20);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.queued, 0);

    // every worker slot went back to the pool
    let balancer = &stack.balancer;
    let released = wait_until(Duration::from_secs(2), || async move {
        balancer.pool_stats("default").await.unwrap().active_tasks == 0
    })
    .await;
    assert!(released);
    stack.processor.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_cancels_queue_and_stragglers() {
    let stack = create_test_stack(
        MonitoringConfig::default(),
        ProcessingConfig {
            max_concurrent_tasks: 2,
            ..Default::default()
        },
        ScalingConfig::default(),
        2,
    );
    stack.processor.start().await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = stack
            .processor
            .submit(TaskSpec::new("slow", sleeper(Duration::from_secs(30))))
            .await
            .unwrap();
        ids.push(id);
    }

    let processor = &stack.processor;
    let started = wait_until(Duration::from_secs(2), || async move {
        processor.get_stats().await.running == 2
    })
    .await;
    assert!(started);

    let report = stack.processor.shutdown(Duration::from_millis(100)).await;
    assert_eq!(report.cancelled_pending, 3);
    assert_eq!(report.force_cancelled, 2);

    for id in &ids {
        let task = stack.processor.get_task_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    assert_matches!(
        stack
            .processor
            .submit(TaskSpec::new("late", sleeper(Duration::ZERO)))
            .await,
        Err(ScalingError::ShuttingDown)
    );
    assert!(!stack.processor.get_stats().await.accepting);
}

#[tokio::test]
async fn test_health_loop_times_out_hung_task() {
    let stack = create_test_stack(
        MonitoringConfig::default(),
        ProcessingConfig {
            health_check_interval_secs: 1,
            ..Default::default()
        },
        ScalingConfig::default(),
        1,
    );
    stack.processor.start().await;

    let id = stack
        .processor
        .submit(
            TaskSpec::new("hang", sleeper(Duration::from_secs(60)))
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(0),
        )
        .await
        .unwrap();

    let (processor, task_id) = (&stack.processor, &id);
    let failed = wait_until(Duration::from_secs(5), || async move {
        processor
            .get_task_status(task_id)
            .await
            .is_some_and(|task| task.status == TaskStatus::Failed)
    })
    .await;
    assert!(failed);

    let task = stack.processor.get_task_status(&id).await.unwrap();
    assert_matches!(task.error, Some(TaskError::Timeout(100)));
    assert_eq!(stack.processor.get_stats().await.timed_out, 1);
    stack.processor.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_manager_shutdown_drains_processor() {
    let stack = create_test_stack(
        fast_monitoring(),
        ProcessingConfig::default(),
        ScalingConfig::default(),
        2,
    );
    stack.source.set(SystemReadings::with_usage(20.0, 30.0));
    stack.manager.start().await;

    let quick = stack
        .processor
        .submit(TaskSpec::new("quick", sleeper(Duration::from_millis(10))))
        .await
        .unwrap();
    stack
        .processor
        .wait_for(&quick, Duration::from_secs(5))
        .await
        .unwrap();

    let report = stack.manager.shutdown(Duration::from_secs(1)).await;
    assert_eq!(report.cancelled_pending, 0);
    assert_eq!(report.force_cancelled, 0);
    assert_matches!(
        stack
            .processor
            .submit(TaskSpec::new("late", sleeper(Duration::ZERO)))
            .await,
        Err(ScalingError::ShuttingDown)
    );
}
