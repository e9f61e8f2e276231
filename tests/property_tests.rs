//! Property-based tests for invariants using proptest
//!
//! These tests verify that certain properties hold true for all inputs:
//! - Alerts open and resolve alternately, one open alert per level
//! - Hysteresis keeps open alerts from flapping
//! - The task queue serves priorities in order, FIFO within a priority
//! - Worker pools stay within bounds and capacity
//! - Retention patterns never let `*` cross a directory separator
//! - Storage usage math stays within range

use chrono::{TimeDelta, Utc};
use proptest::prelude::*;
use resource_scaler::alerts::{AlertLevel, AlertTracker, AlertTransition, ResourceEvaluation};
use resource_scaler::balancer::{OverloadLimits, WorkerPool};
use resource_scaler::config::{PoolConfig, Thresholds};
use resource_scaler::monitors::resources::ResourceType;
use resource_scaler::processing::{TaskPriority, TaskQueue};
use resource_scaler::storage::retention::{compile_pattern, pattern_matches};
use resource_scaler::storage::{StorageUsage, project_growth};

fn priority() -> impl Strategy<Value = TaskPriority> {
    prop_oneof![
        Just(TaskPriority::Low),
        Just(TaskPriority::Normal),
        Just(TaskPriority::High),
        Just(TaskPriority::Critical),
    ]
}

// Property: Openings and resolutions alternate per level, so at most one alert is open
proptest! {
    #[test]
    fn prop_one_open_alert_per_level(
        values in prop::collection::vec(0.0f64..110.0, 1..60),
    ) {
        let thresholds = Thresholds::new(70.0, 85.0, 95.0);
        let mut tracker = AlertTracker::new(0.9, 1000);
        let mut open = [false; 3];
        let at = Utc::now();

        for (i, value) in values.iter().enumerate() {
            let transitions = tracker.evaluate(
                "cpu",
                ResourceType::Cpu,
                *value,
                &thresholds,
                at + TimeDelta::seconds(i as i64),
            );
            for transition in transitions {
                let slot = match transition.alert().level {
                    AlertLevel::Warning => 0,
                    AlertLevel::Critical => 1,
                    AlertLevel::Emergency => 2,
                    AlertLevel::Info => unreachable!("info alerts carry no threshold"),
                };
                match transition {
                    AlertTransition::Opened(_) => {
                        prop_assert!(!open[slot]);
                        open[slot] = true;
                    }
                    AlertTransition::Resolved(_) => {
                        prop_assert!(open[slot]);
                        open[slot] = false;
                    }
                }
            }
            prop_assert_eq!(
                tracker.open_alerts().len(),
                open.iter().filter(|o| **o).count()
            );
        }
    }
}

// Property: An open alert stays open while the value is above threshold * resolve_ratio
proptest! {
    #[test]
    fn prop_open_alert_does_not_flap(
        threshold in 10.0f64..100.0,
        ratio in 0.5f64..1.0,
        offset in 0.0f64..50.0,
    ) {
        let value = threshold * ratio + offset;
        prop_assert_eq!(
            ResourceEvaluation::evaluate(value, threshold, ratio, true),
            ResourceEvaluation::Exceeding
        );
    }
}

// Property: Without an open alert, reaching the threshold always opens one
proptest! {
    #[test]
    fn prop_reaching_threshold_opens(
        threshold in 0.0f64..100.0,
        ratio in 0.5f64..1.0,
        excess in 0.0f64..50.0,
    ) {
        prop_assert_eq!(
            ResourceEvaluation::evaluate(threshold + excess, threshold, ratio, false),
            ResourceEvaluation::StartsToExceed
        );
    }
}

// Property: Pops never increase priority and equal priorities come out FIFO
proptest! {
    #[test]
    fn prop_queue_priority_then_fifo(
        priorities in prop::collection::vec(priority(), 0..100),
    ) {
        let mut queue = TaskQueue::new();
        for (i, priority) in priorities.iter().enumerate() {
            queue.push(i.to_string(), *priority);
        }
        prop_assert_eq!(queue.len(), priorities.len());

        let mut previous: Option<(TaskPriority, usize)> = None;
        while let Some(entry) = queue.pop() {
            let index: usize = entry.task_id.parse().unwrap();
            prop_assert_eq!(entry.priority, priorities[index]);
            if let Some((last_priority, last_index)) = previous {
                prop_assert!(entry.priority <= last_priority);
                if entry.priority == last_priority {
                    prop_assert!(index > last_index);
                }
            }
            previous = Some((entry.priority, index));
        }
        prop_assert!(queue.is_empty());
    }
}

// Property: Resizing always lands inside the pool bounds
proptest! {
    #[test]
    fn prop_pool_resize_within_bounds(
        min in 1usize..5,
        extra in 0usize..10,
        initial in 0usize..20,
        targets in prop::collection::vec(0usize..30, 1..10),
    ) {
        let max = min + extra;
        let mut pool = WorkerPool::new(
            &PoolConfig {
                min_workers: min,
                max_workers: max,
                initial_workers: initial,
                ..Default::default()
            },
            OverloadLimits::default(),
            50,
        );
        prop_assert!(pool.worker_count() >= min && pool.worker_count() <= max);

        for target in targets {
            pool.resize(target, "property");
            prop_assert_eq!(pool.worker_count(), target.clamp(min, max));
        }
    }
}

// Property: Assignment never exceeds the capacity of a worker or the pool
proptest! {
    #[test]
    fn prop_pool_assignment_respects_capacity(
        workers in 1usize..6,
        capacity in 1usize..5,
        tasks in 0usize..50,
    ) {
        let mut pool = WorkerPool::new(
            &PoolConfig {
                min_workers: 1,
                max_workers: 10,
                initial_workers: workers,
                max_concurrent_per_worker: capacity,
                ..Default::default()
            },
            OverloadLimits::default(),
            50,
        );

        let assigned = (0..tasks)
            .filter(|i| pool.assign(&format!("task-{i}")).is_some())
            .count();
        prop_assert_eq!(assigned, tasks.min(workers * capacity));
        prop_assert!(pool.workers().iter().all(|w| w.active_count() <= capacity));
    }
}

// Property: A single `*` matches within one path segment only
proptest! {
    #[test]
    fn prop_star_never_crosses_separator(
        dir in "[a-z]{1,8}",
        name in "[a-z0-9_]{1,12}",
    ) {
        let file = format!("{name}.log");
        let nested_file = format!("{dir}/{name}.log");
        let deep_file = format!("{dir}/{dir}/{name}.log");
        let child = format!("{dir}/{name}");
        let grandchild = format!("{dir}/{name}/{name}");

        let by_name = compile_pattern("*.log").unwrap();
        prop_assert!(pattern_matches(&by_name, &file));
        prop_assert!(!pattern_matches(&by_name, &nested_file));

        let in_dir = compile_pattern(&format!("{dir}/*")).unwrap();
        prop_assert!(pattern_matches(&in_dir, &child));
        prop_assert!(!pattern_matches(&in_dir, &grandchild));

        let anywhere = compile_pattern("**/*.log").unwrap();
        prop_assert!(pattern_matches(&anywhere, &file));
        prop_assert!(pattern_matches(&anywhere, &deep_file));
    }
}

// Property: Usage percentage stays within 0..=100 and used + free == total
proptest! {
    #[test]
    fn prop_usage_percentage_in_range(
        total in 0u64..1_000_000_000_000,
        free_share in 0.0f64..=1.0,
    ) {
        let free = (total as f64 * free_share) as u64;
        let usage = StorageUsage::new("/data", total, free, 0, "general", None, Utc::now());
        prop_assert!(usage.usage_percentage >= 0.0 && usage.usage_percentage <= 100.0);
        prop_assert_eq!(usage.used_bytes + usage.free_bytes, total);
    }
}

// Property: A projection never reports a negative time until full
proptest! {
    #[test]
    fn prop_days_until_full_not_negative(
        used in prop::collection::vec(0u64..1_000_000, 2..20),
        free in 0u64..1_000_000,
    ) {
        let start = Utc::now() - TimeDelta::days(used.len() as i64);
        let samples: Vec<_> = used
            .iter()
            .enumerate()
            .map(|(day, used)| (start + TimeDelta::days(day as i64), *used))
            .collect();
        let total = free + used.last().copied().unwrap_or(0);

        if let Some(growth) = project_growth("/data", &samples, free, total) {
            prop_assert!(growth.days_until_full.is_none_or(|days| days >= 0.0));
        }
    }
}
