//! Mode transitions and scaling of a running instance

use std::time::Duration;

use resource_scaler::actors::messages::{AlertEvent, ScalingEvent};
use resource_scaler::alerts::AlertLevel;
use resource_scaler::config::{MonitoringConfig, ProcessingConfig, ScalingConfig};
use resource_scaler::monitors::source::SystemReadings;
use resource_scaler::scaling::{DecisionKind, ScalabilityMode};
use tokio::sync::broadcast;

use crate::helpers::*;

async fn next_mode_change(
    events: &mut broadcast::Receiver<ScalingEvent>,
) -> Option<(ScalabilityMode, ScalabilityMode)> {
    loop {
        match events.recv().await {
            Ok(ScalingEvent::ModeChanged { from, to, .. }) => return Some((from, to)),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[tokio::test]
async fn test_cpu_spike_degrades_running_instance() {
    let mut stack = create_test_stack(
        fast_monitoring(),
        ProcessingConfig::default(),
        ScalingConfig {
            check_interval_secs: 1,
            ..Default::default()
        },
        4,
    );
    for cpu in [50.0, 60.0, 92.0, 93.0, 94.0] {
        stack.source.push(SystemReadings::with_usage(cpu, 40.0));
    }
    let mut events = stack.manager.subscribe();
    stack.manager.start().await;

    let change = tokio::time::timeout(Duration::from_secs(15), next_mode_change(&mut events))
        .await
        .unwrap();
    assert_eq!(
        change,
        Some((ScalabilityMode::Normal, ScalabilityMode::Degraded))
    );
    assert_eq!(stack.balancer.total_workers().await, 2);

    // the critical cpu alert opened on the 92% sample
    let critical = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stack.alerts.recv().await {
                Ok(AlertEvent::Opened(alert))
                    if alert.subject == "cpu" && alert.level == AlertLevel::Critical =>
                {
                    return alert;
                }
                Ok(_) => continue,
                Err(e) => panic!("alert channel failed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(critical.current_value, 92.0);

    let status = stack.manager.get_status().await;
    assert_eq!(status.mode, ScalabilityMode::Degraded);
    assert!(!status.balancer_auto_scaling);
    assert_eq!(status.total_workers, 2);
    assert!(
        status
            .recent_decisions
            .iter()
            .any(|d| d.kind == DecisionKind::ModeChange && d.to_workers == 2)
    );

    stack.manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_emergency_then_recovery_restores_pools() {
    let stack = create_test_stack(
        MonitoringConfig::default(),
        ProcessingConfig::default(),
        ScalingConfig::default(),
        4,
    );
    let mut events = stack.manager.subscribe();

    stack.source.set(SystemReadings::with_usage(97.0, 50.0));
    stack.monitor.sample().await.unwrap();
    assert_eq!(
        stack.manager.check_mode().await,
        Some(ScalabilityMode::Emergency)
    );
    assert_eq!(stack.balancer.total_workers().await, 1);
    assert!(stack.balancer.is_degraded());
    assert!(!stack.balancer.auto_scaling_enabled());

    stack.source.set(SystemReadings::with_usage(20.0, 30.0));
    stack.monitor.sample().await.unwrap();
    assert_eq!(
        stack.manager.check_mode().await,
        Some(ScalabilityMode::Normal)
    );
    assert!(!stack.balancer.is_degraded());
    assert!(stack.balancer.auto_scaling_enabled());

    assert_eq!(
        next_mode_change(&mut events).await,
        Some((ScalabilityMode::Normal, ScalabilityMode::Emergency))
    );
    assert_eq!(
        next_mode_change(&mut events).await,
        Some((ScalabilityMode::Emergency, ScalabilityMode::Normal))
    );
}

#[tokio::test]
async fn test_manual_scale_publishes_event() {
    let stack = create_test_stack(
        MonitoringConfig::default(),
        ProcessingConfig::default(),
        ScalingConfig::default(),
        2,
    );
    let mut events = stack.manager.subscribe();

    assert!(stack.manager.manual_scale(6, "load test").await);
    assert_eq!(stack.balancer.total_workers().await, 6);

    match events.recv().await.unwrap() {
        ScalingEvent::WorkersScaled {
            from, to, reason, ..
        } => {
            assert_eq!((from, to), (2, 6));
            assert!(reason.contains("load test"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // outside the configured bounds
    assert!(!stack.manager.manual_scale(0, "too small").await);
    assert!(!stack.manager.manual_scale(50, "too large").await);
    assert_eq!(stack.balancer.total_workers().await, 6);

    let history = stack.manager.decision_history().await;
    let manual: Vec<_> = history
        .iter()
        .filter(|d| d.kind == DecisionKind::Manual)
        .collect();
    assert_eq!(manual.len(), 1);
    assert!(manual[0].applied);
}
