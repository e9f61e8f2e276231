use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::processing::task::TaskId;

use super::strategy::{SelectionState, SelectionStrategy};
use super::worker::{OverloadLimits, Worker, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

/// One recorded change of a pool's worker count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingAction {
    pub pool: String,
    pub direction: ScaleDirection,
    pub from: usize,
    pub to: usize,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Thresholds of the pool-local auto-scaler
#[derive(Debug, Clone, Copy)]
pub struct AutoScalePolicy {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub strategy: SelectionStrategy,
    pub workers: usize,
    pub draining: usize,
    pub available: usize,
    pub active_tasks: usize,
    /// Task slots currently offered (halved while degraded)
    pub capacity: usize,
    /// Task slots at full capacity
    pub nominal_capacity: usize,
    pub load: f64,
    pub degraded: bool,
    pub completed: u64,
    pub failed: u64,
    pub min_workers: usize,
    pub max_workers: usize,
}

/// Named set of workers; always accessed under the pool's lock
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    strategy: SelectionStrategy,
    min_workers: usize,
    max_workers: usize,
    per_worker_capacity: usize,
    worker_weight: u32,
    workers: Vec<Worker>,
    selection: SelectionState,
    limits: OverloadLimits,
    degraded: bool,
    last_scale_action: Option<Instant>,
    next_worker_id: u64,
    history: VecDeque<ScalingAction>,
    history_size: usize,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig, limits: OverloadLimits, history_size: usize) -> Self {
        let mut pool = Self {
            name: config.name.clone(),
            strategy: config.strategy,
            min_workers: config.min_workers.max(1),
            max_workers: config.max_workers.max(config.min_workers.max(1)),
            per_worker_capacity: config.max_concurrent_per_worker.max(1),
            worker_weight: config.worker_weight,
            workers: Vec::new(),
            selection: SelectionState {
                round_robin_index: 0,
                rng: StdRng::from_os_rng(),
            },
            limits,
            degraded: false,
            last_scale_action: None,
            next_worker_id: 0,
            history: VecDeque::new(),
            history_size,
        };

        let initial = config
            .initial_workers
            .clamp(pool.min_workers, pool.max_workers);
        for _ in 0..initial {
            pool.spawn_worker();
        }
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: SelectionStrategy) -> SelectionStrategy {
        std::mem::replace(&mut self.strategy, strategy)
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min_workers, self.max_workers)
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Workers not draining
    pub fn worker_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status != WorkerStatus::Shutdown)
            .count()
    }

    pub fn active_tasks(&self) -> usize {
        self.workers.iter().map(Worker::active_count).sum()
    }

    /// Share of nominal capacity in use
    pub fn load(&self) -> f64 {
        let capacity = self.worker_count() * self.per_worker_capacity;
        if capacity == 0 {
            return if self.active_tasks() > 0 { 1.0 } else { 0.0 };
        }
        self.active_tasks() as f64 / capacity as f64
    }

    fn spawn_worker(&mut self) -> String {
        self.next_worker_id += 1;
        let id = format!("{}-worker-{}", self.name, self.next_worker_id);
        let mut worker = Worker::new(id.clone(), self.per_worker_capacity, self.worker_weight);
        if self.degraded {
            worker.set_degraded(true, &self.limits);
        }
        self.workers.push(worker);
        id
    }

    /// Pick a worker and record the task on it
    pub fn assign(&mut self, task_id: &str) -> Option<String> {
        let limits = self.limits;
        let candidates: Vec<&Worker> = self
            .workers
            .iter()
            .filter(|w| w.is_available(&limits))
            .collect();

        let chosen = self.strategy.select(&candidates, &mut self.selection)?;
        let worker_id = candidates[chosen].id.clone();

        let worker = self.workers.iter_mut().find(|w| w.id == worker_id)?;
        worker.assign(task_id.to_string(), &limits);
        Some(worker_id)
    }

    pub fn release(&mut self, worker_id: &str, task_id: &str, success: bool) -> bool {
        let limits = self.limits;
        let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) else {
            return false;
        };
        let released = worker.release(task_id, success, &limits);

        // drained workers leave once their last task is done
        if worker.status == WorkerStatus::Shutdown && worker.active_tasks.is_empty() {
            let id = worker.id.clone();
            self.workers.retain(|w| w.id != id);
            debug!("drained worker {id} removed from pool {}", self.name);
        }
        released
    }

    pub fn update_worker_stats(&mut self, worker_id: &str, cpu: f64, memory_mb: f64) -> bool {
        let limits = self.limits;
        match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(worker) => {
                worker.update_stats(cpu, memory_mb, &limits);
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, worker_id: &str) -> bool {
        match self.workers.iter_mut().find(|w| w.id == worker_id) {
            Some(worker) => {
                worker.status = WorkerStatus::Failed;
                true
            }
            None => false,
        }
    }

    pub fn set_degraded(&mut self, degraded: bool) {
        if self.degraded == degraded {
            return;
        }
        self.degraded = degraded;
        let limits = self.limits;
        for worker in &mut self.workers {
            worker.set_degraded(degraded, &limits);
        }
    }

    fn cooldown_elapsed(&self, cooldown: Duration) -> bool {
        self.last_scale_action
            .is_none_or(|last| last.elapsed() >= cooldown)
    }

    /// One auto-scaling evaluation; at most one worker added or removed
    pub fn auto_scale(&mut self, policy: &AutoScalePolicy) -> Option<ScalingAction> {
        let load = self.load();
        let count = self.worker_count();

        if load > policy.scale_up_threshold
            && count < self.max_workers
            && self.cooldown_elapsed(policy.scale_up_cooldown)
        {
            self.spawn_worker();
            return Some(self.record(
                ScaleDirection::Up,
                count,
                count + 1,
                format!("pool load {load:.2} above {:.2}", policy.scale_up_threshold),
            ));
        }

        if load < policy.scale_down_threshold
            && count > self.min_workers
            && self.cooldown_elapsed(policy.scale_down_cooldown)
            && self.remove_idle_worker().is_some()
        {
            return Some(self.record(
                ScaleDirection::Down,
                count,
                count - 1,
                format!("pool load {load:.2} below {:.2}", policy.scale_down_threshold),
            ));
        }

        None
    }

    /// Remove the idle worker that has been quiet the longest
    fn remove_idle_worker(&mut self) -> Option<String> {
        let id = self
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Idle && w.active_tasks.is_empty())
            .min_by_key(|w| w.last_activity)
            .map(|w| w.id.clone())?;
        self.workers.retain(|w| w.id != id);
        Some(id)
    }

    /// Move the worker count to `target`, clamped to the pool bounds
    ///
    /// Busy workers chosen for removal drain instead of being dropped.
    pub fn resize(&mut self, target: usize, reason: &str) -> Option<ScalingAction> {
        let target = target.clamp(self.min_workers, self.max_workers);
        let count = self.worker_count();

        match target.cmp(&count) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => {
                for _ in count..target {
                    self.spawn_worker();
                }
                Some(self.record(ScaleDirection::Up, count, target, reason.to_string()))
            }
            std::cmp::Ordering::Less => {
                let mut excess = count - target;
                while excess > 0 && self.remove_idle_worker().is_some() {
                    excess -= 1;
                }
                if excess > 0 {
                    let mut busy: Vec<(usize, String)> = self
                        .workers
                        .iter()
                        .filter(|w| w.status != WorkerStatus::Shutdown)
                        .map(|w| (w.active_count(), w.id.clone()))
                        .collect();
                    busy.sort();
                    for (_, id) in busy.into_iter().take(excess) {
                        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == id) {
                            worker.status = WorkerStatus::Shutdown;
                        }
                    }
                }
                Some(self.record(ScaleDirection::Down, count, target, reason.to_string()))
            }
        }
    }

    fn record(
        &mut self,
        direction: ScaleDirection,
        from: usize,
        to: usize,
        reason: String,
    ) -> ScalingAction {
        info!("pool {} scaled {direction:?} {from} -> {to}: {reason}", self.name);
        let action = ScalingAction {
            pool: self.name.clone(),
            direction,
            from,
            to,
            reason,
            timestamp: Utc::now(),
        };
        self.last_scale_action = Some(Instant::now());
        self.history.push_back(action.clone());
        while self.history.len() > self.history_size {
            self.history.pop_front();
        }
        action
    }

    pub fn history(&self) -> Vec<ScalingAction> {
        self.history.iter().cloned().collect()
    }

    pub fn stats(&self) -> PoolStats {
        let limits = self.limits;
        PoolStats {
            name: self.name.clone(),
            strategy: self.strategy,
            workers: self.worker_count(),
            draining: self.workers.len() - self.worker_count(),
            available: self
                .workers
                .iter()
                .filter(|w| w.is_available(&limits))
                .count(),
            active_tasks: self.active_tasks(),
            capacity: self
                .workers
                .iter()
                .filter(|w| w.status != WorkerStatus::Shutdown)
                .map(|w| w.max_concurrent_tasks)
                .sum(),
            nominal_capacity: self.worker_count() * self.per_worker_capacity,
            load: self.load(),
            degraded: self.degraded,
            completed: self.workers.iter().map(|w| w.completed_count).sum(),
            failed: self.workers.iter().map(|w| w.failed_count).sum(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(initial: usize, min: usize, max: usize, capacity: usize) -> WorkerPool {
        let config = PoolConfig {
            name: "test".to_string(),
            strategy: SelectionStrategy::LeastConnections,
            min_workers: min,
            max_workers: max,
            initial_workers: initial,
            max_concurrent_per_worker: capacity,
            worker_weight: 1,
        };
        WorkerPool::new(&config, OverloadLimits::default(), 10)
    }

    fn policy() -> AutoScalePolicy {
        AutoScalePolicy {
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_assignment_never_exceeds_capacity() {
        let mut pool = pool(2, 1, 2, 2);
        let assigned: Vec<Option<String>> =
            (0..5).map(|i| pool.assign(&format!("t{i}"))).collect();

        assert_eq!(assigned.iter().filter(|a| a.is_some()).count(), 4);
        assert!(assigned[4].is_none());
        assert!(pool.workers().iter().all(|w| w.active_count() <= 2));
    }

    #[test]
    fn test_release_frees_slot() {
        let mut pool = pool(1, 1, 1, 1);
        let worker = pool.assign("t1").unwrap();
        assert!(pool.assign("t2").is_none());
        assert!(pool.release(&worker, "t1", true));
        assert_eq!(pool.assign("t2"), Some(worker));
        assert_eq!(pool.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_scale_up_respects_cooldown() {
        let mut pool = pool(1, 1, 5, 2);
        pool.assign("t1");
        pool.assign("t2");

        let action = pool.auto_scale(&policy()).unwrap();
        assert_eq!(action.direction, ScaleDirection::Up);
        assert_eq!(pool.worker_count(), 2);

        // still overloaded one second later: cooldown blocks it
        pool.assign("t3");
        pool.assign("t4");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(pool.auto_scale(&policy()).is_none());
        assert_eq!(pool.history().len(), 1);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(pool.auto_scale(&policy()).is_some());
        assert_eq!(pool.worker_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_scale_down_removes_idle_worker() {
        let mut pool = pool(3, 1, 5, 4);
        let action = pool.auto_scale(&policy()).unwrap();
        assert_eq!(action.direction, ScaleDirection::Down);
        assert_eq!(pool.worker_count(), 2);

        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(pool.auto_scale(&policy()).is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(pool.auto_scale(&policy()).is_some());
        assert_eq!(pool.worker_count(), 1);

        // at min_workers
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(pool.auto_scale(&policy()).is_none());
    }

    #[test]
    fn test_auto_scale_stays_within_max() {
        let mut pool = pool(2, 1, 2, 1);
        pool.assign("t1");
        pool.assign("t2");
        assert!(pool.auto_scale(&policy()).is_none());
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn test_resize_clamps_and_drains_busy_workers() {
        let mut pool = pool(4, 1, 6, 2);
        pool.assign("t1");
        pool.assign("t2");
        pool.assign("t3");
        pool.assign("t4");

        let action = pool.resize(1, "shrink").unwrap();
        assert_eq!(action.to, 1);
        assert_eq!(pool.worker_count(), 1);
        let stats = pool.stats();
        assert_eq!(stats.draining, 3);
        assert_eq!(stats.active_tasks, 4);

        // draining workers take no work and leave once empty
        let drained: Vec<(String, String)> = pool
            .workers()
            .iter()
            .filter(|w| w.status == WorkerStatus::Shutdown)
            .flat_map(|w| w.active_tasks.iter().map(|t| (w.id.clone(), t.clone())))
            .collect();
        for (worker, task) in drained {
            pool.release(&worker, &task, true);
        }
        assert_eq!(pool.workers().len(), 1);

        assert_eq!(pool.resize(100, "grow").unwrap().to, 6);
        assert!(pool.resize(6, "noop").is_none());
    }

    #[test]
    fn test_degraded_pool_halves_capacity() {
        let mut pool = pool(2, 1, 4, 4);
        pool.set_degraded(true);
        assert_eq!(pool.stats().capacity, 4);
        pool.resize(3, "grow");
        assert_eq!(pool.stats().capacity, 6);
        pool.set_degraded(false);
        assert_eq!(pool.stats().capacity, 12);
    }
}
