use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::processing::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Overloaded,
    Failed,
    /// Draining after a scale down; takes no new tasks
    Shutdown,
}

/// Resource bounds beyond which a worker counts as overloaded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverloadLimits {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl Default for OverloadLimits {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_mb: 2048.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: String,
    pub max_concurrent_tasks: usize,
    /// Capacity outside of degraded mode
    pub base_max_concurrent_tasks: usize,
    pub active_tasks: HashSet<TaskId>,
    pub completed_count: u64,
    pub failed_count: u64,
    pub status: WorkerStatus,
    pub weight: u32,
    pub cpu_usage: f64,
    pub memory_mb: f64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: impl Into<String>, max_concurrent_tasks: usize, weight: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            max_concurrent_tasks,
            base_max_concurrent_tasks: max_concurrent_tasks,
            active_tasks: HashSet::new(),
            completed_count: 0,
            failed_count: 0,
            status: WorkerStatus::Idle,
            weight,
            cpu_usage: 0.0,
            memory_mb: 0.0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_tasks.len()
    }

    pub fn is_overloaded(&self, limits: &OverloadLimits) -> bool {
        self.active_count() >= self.max_concurrent_tasks
            || self.cpu_usage > limits.cpu_percent
            || self.memory_mb > limits.memory_mb
    }

    pub fn is_available(&self, limits: &OverloadLimits) -> bool {
        matches!(self.status, WorkerStatus::Idle | WorkerStatus::Busy)
            && !self.is_overloaded(limits)
    }

    /// Composite score, lower is better
    pub fn load_score(&self) -> f64 {
        self.active_count() as f64 * 10.0
            + self.cpu_usage * 0.5
            + (self.memory_mb / 1024.0) * 0.3
            + self.failed_count as f64 * 2.0
    }

    /// Derive the status from the current load; `Failed` and `Shutdown` stick
    pub fn refresh_status(&mut self, limits: &OverloadLimits) {
        if matches!(self.status, WorkerStatus::Failed | WorkerStatus::Shutdown) {
            return;
        }
        self.status = if self.is_overloaded(limits) {
            WorkerStatus::Overloaded
        } else if self.active_tasks.is_empty() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
    }

    pub fn assign(&mut self, task_id: TaskId, limits: &OverloadLimits) {
        self.active_tasks.insert(task_id);
        self.last_activity = Utc::now();
        self.refresh_status(limits);
    }

    /// Returns `false` when the task was not running here
    pub fn release(&mut self, task_id: &str, success: bool, limits: &OverloadLimits) -> bool {
        if !self.active_tasks.remove(task_id) {
            return false;
        }
        if success {
            self.completed_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.last_activity = Utc::now();
        self.refresh_status(limits);
        true
    }

    pub fn set_degraded(&mut self, degraded: bool, limits: &OverloadLimits) {
        self.max_concurrent_tasks = if degraded {
            (self.base_max_concurrent_tasks / 2).max(1)
        } else {
            self.base_max_concurrent_tasks
        };
        self.refresh_status(limits);
    }

    pub fn update_stats(&mut self, cpu_usage: f64, memory_mb: f64, limits: &OverloadLimits) {
        self.cpu_usage = cpu_usage;
        self.memory_mb = memory_mb;
        self.refresh_status(limits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_by_capacity_cpu_and_memory() {
        let limits = OverloadLimits::default();
        let mut worker = Worker::new("w", 2, 1);
        assert!(worker.is_available(&limits));

        worker.assign("t1".into(), &limits);
        worker.assign("t2".into(), &limits);
        assert!(worker.is_overloaded(&limits));
        assert_eq!(worker.status, WorkerStatus::Overloaded);
        assert!(!worker.is_available(&limits));

        worker.release("t1", true, &limits);
        assert_eq!(worker.status, WorkerStatus::Busy);

        worker.update_stats(95.0, 100.0, &limits);
        assert!(worker.is_overloaded(&limits));

        worker.update_stats(10.0, 4096.0, &limits);
        assert!(worker.is_overloaded(&limits));

        worker.update_stats(10.0, 100.0, &limits);
        assert!(worker.is_available(&limits));
    }

    #[test]
    fn test_load_score() {
        let limits = OverloadLimits::default();
        let mut worker = Worker::new("w", 4, 1);
        worker.assign("t1".into(), &limits);
        worker.update_stats(50.0, 2048.0, &limits);
        worker.failed_count = 1;
        // 10 + 25 + 0.6 + 2
        assert!((worker.load_score() - 37.6).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_capacity_is_halved_with_floor() {
        let limits = OverloadLimits::default();
        let mut worker = Worker::new("w", 5, 1);
        worker.set_degraded(true, &limits);
        assert_eq!(worker.max_concurrent_tasks, 2);
        worker.set_degraded(false, &limits);
        assert_eq!(worker.max_concurrent_tasks, 5);

        let mut single = Worker::new("s", 1, 1);
        single.set_degraded(true, &limits);
        assert_eq!(single.max_concurrent_tasks, 1);
    }

    #[test]
    fn test_release_unknown_task() {
        let limits = OverloadLimits::default();
        let mut worker = Worker::new("w", 2, 1);
        assert!(!worker.release("missing", true, &limits));
        assert_eq!(worker.completed_count, 0);
    }
}
