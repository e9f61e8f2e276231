use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, instrument, warn};

use crate::config::{BalancerConfig, PoolConfig};
use crate::error::{ScalingError, ScalingResult};

use super::pool::{AutoScalePolicy, PoolStats, ScalingAction, WorkerPool};
use super::strategy::SelectionStrategy;
use super::worker::OverloadLimits;

/// Worker placement across named pools
///
/// Every pool sits behind its own lock, so two concurrent assignments to
/// the same pool are serialized and never overfill a worker.
#[derive(Debug)]
pub struct LoadBalancer {
    config: BalancerConfig,
    limits: OverloadLimits,
    pools: RwLock<HashMap<String, Arc<Mutex<WorkerPool>>>>,
    auto_scaling: AtomicBool,
    degraded: AtomicBool,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        let limits = OverloadLimits {
            cpu_percent: config.overload_cpu_percent,
            memory_mb: config.overload_memory_mb,
        };

        let pools = config
            .pools
            .iter()
            .map(|pool| {
                (
                    pool.name.clone(),
                    Arc::new(Mutex::new(WorkerPool::new(
                        pool,
                        limits,
                        config.scaling_history_size,
                    ))),
                )
            })
            .collect();

        Self {
            auto_scaling: AtomicBool::new(config.auto_scaling),
            degraded: AtomicBool::new(false),
            config,
            limits,
            pools: RwLock::new(pools),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub async fn add_pool(&self, config: &PoolConfig) {
        let mut pool = WorkerPool::new(config, self.limits, self.config.scaling_history_size);
        pool.set_degraded(self.is_degraded());
        self.pools
            .write()
            .await
            .insert(config.name.clone(), Arc::new(Mutex::new(pool)));
    }

    async fn pool(&self, name: &str) -> ScalingResult<Arc<Mutex<WorkerPool>>> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ScalingError::UnknownPool(name.to_string()))
    }

    async fn all_pools(&self) -> Vec<Arc<Mutex<WorkerPool>>> {
        self.pools.read().await.values().cloned().collect()
    }

    pub async fn has_pool(&self, name: &str) -> bool {
        self.pools.read().await.contains_key(name)
    }

    pub async fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Place a task on a worker of `pool`; `None` when every worker is busy
    pub async fn assign(&self, pool: &str, task_id: &str) -> ScalingResult<Option<String>> {
        let pool = self.pool(pool).await?;
        let mut pool = pool.lock().await;
        let worker = pool.assign(task_id);
        match &worker {
            Some(worker) => debug!("task {task_id} assigned to {worker}"),
            None => debug!("no available worker in pool {} for {task_id}", pool.name()),
        }
        Ok(worker)
    }

    pub async fn release(
        &self,
        pool: &str,
        worker_id: &str,
        task_id: &str,
        success: bool,
    ) -> ScalingResult<bool> {
        let pool = self.pool(pool).await?;
        let released = pool.lock().await.release(worker_id, task_id, success);
        if !released {
            warn!("task {task_id} was not active on worker {worker_id}");
        }
        Ok(released)
    }

    /// Record resource usage reported by a worker
    pub async fn report_worker_stats(
        &self,
        pool: &str,
        worker_id: &str,
        cpu_usage: f64,
        memory_mb: f64,
    ) -> ScalingResult<bool> {
        let pool = self.pool(pool).await?;
        let updated = pool
            .lock()
            .await
            .update_worker_stats(worker_id, cpu_usage, memory_mb);
        Ok(updated)
    }

    pub async fn mark_worker_failed(&self, pool: &str, worker_id: &str) -> ScalingResult<bool> {
        let pool = self.pool(pool).await?;
        let marked = pool.lock().await.mark_failed(worker_id);
        Ok(marked)
    }

    pub async fn pool_stats(&self, pool: &str) -> ScalingResult<PoolStats> {
        let pool = self.pool(pool).await?;
        let stats = pool.lock().await.stats();
        Ok(stats)
    }

    pub async fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats = vec![];
        for pool in self.all_pools().await {
            stats.push(pool.lock().await.stats());
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub async fn scaling_history(&self, pool: &str) -> ScalingResult<Vec<ScalingAction>> {
        let pool = self.pool(pool).await?;
        let history = pool.lock().await.history();
        Ok(history)
    }

    /// Workers across every pool
    pub async fn total_workers(&self) -> usize {
        let mut total = 0;
        for pool in self.all_pools().await {
            total += pool.lock().await.worker_count();
        }
        total
    }

    /// Active tasks over nominal capacity across every pool
    pub async fn system_load(&self) -> f64 {
        let mut active = 0usize;
        let mut capacity = 0usize;
        for pool in self.all_pools().await {
            let stats = pool.lock().await.stats();
            active += stats.active_tasks;
            capacity += stats.nominal_capacity;
        }
        if capacity == 0 {
            return 0.0;
        }
        active as f64 / capacity as f64
    }

    pub async fn set_strategy(
        &self,
        pool: &str,
        strategy: SelectionStrategy,
    ) -> ScalingResult<SelectionStrategy> {
        let pool = self.pool(pool).await?;
        let previous = pool.lock().await.set_strategy(strategy);
        if previous != strategy {
            info!("strategy changed {previous} -> {strategy}");
        }
        Ok(previous)
    }

    pub async fn strategies(&self) -> HashMap<String, SelectionStrategy> {
        let mut strategies = HashMap::new();
        for pool in self.all_pools().await {
            let pool = pool.lock().await;
            strategies.insert(pool.name().to_string(), pool.strategy());
        }
        strategies
    }

    /// Resize a pool, clamped to its bounds
    pub async fn scale_pool_to(
        &self,
        pool: &str,
        target: usize,
        reason: &str,
    ) -> ScalingResult<Option<ScalingAction>> {
        let pool = self.pool(pool).await?;
        let action = pool.lock().await.resize(target, reason);
        Ok(action)
    }

    /// Resize every pool with `target(current_count, min, max)`
    pub async fn scale_all_with<F>(&self, reason: &str, target: F) -> Vec<ScalingAction>
    where
        F: Fn(usize, usize, usize) -> usize,
    {
        let mut actions = vec![];
        for pool in self.all_pools().await {
            let mut pool = pool.lock().await;
            let (min, max) = pool.bounds();
            let wanted = target(pool.worker_count(), min, max);
            if let Some(action) = pool.resize(wanted, reason) {
                actions.push(action);
            }
        }
        actions
    }

    pub fn set_auto_scaling(&self, enabled: bool) {
        let previous = self.auto_scaling.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("balancer auto-scaling {}", if enabled { "resumed" } else { "suspended" });
        }
    }

    pub fn auto_scaling_enabled(&self) -> bool {
        self.auto_scaling.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Halve (or restore) every worker's capacity
    pub async fn set_degraded(&self, degraded: bool) {
        let previous = self.degraded.swap(degraded, Ordering::SeqCst);
        if previous != degraded {
            if degraded {
                warn!("entering degraded capacity");
            } else {
                info!("restoring full capacity");
            }
        }
        for pool in self.all_pools().await {
            pool.lock().await.set_degraded(degraded);
        }
    }

    /// Apply the degradation rule to a system load in `0..=1`
    ///
    /// Returns the new degraded flag when it changed.
    pub async fn check_degradation(&self, load: f64) -> Option<bool> {
        let threshold = self.config.degradation_threshold;
        let degraded = self.is_degraded();

        if !degraded && load > threshold {
            self.set_degraded(true).await;
            return Some(true);
        }
        if degraded && load < threshold * self.config.restore_ratio {
            self.set_degraded(false).await;
            return Some(false);
        }
        None
    }

    /// One auto-scaling pass over every pool
    pub async fn auto_scale_tick(&self) -> Vec<ScalingAction> {
        if !self.auto_scaling_enabled() {
            return vec![];
        }

        let policy = AutoScalePolicy {
            scale_up_threshold: self.config.scale_up_threshold,
            scale_down_threshold: self.config.scale_down_threshold,
            scale_up_cooldown: self.config.scale_up_cooldown(),
            scale_down_cooldown: self.config.scale_down_cooldown(),
        };

        let mut actions = vec![];
        for pool in self.all_pools().await {
            if let Some(action) = pool.lock().await.auto_scale(&policy) {
                actions.push(action);
            }
        }
        actions
    }

    /// Degradation check plus auto-scaling; both stand down while suspended
    pub async fn monitor_tick(&self) {
        if !self.auto_scaling_enabled() {
            return;
        }
        let load = self.system_load().await;
        self.check_degradation(load).await;
        let actions = self.auto_scale_tick().await;
        if !actions.is_empty() {
            debug!("auto-scaling applied {} actions", actions.len());
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        debug!(
            "starting balancer monitor with interval {:?}",
            self.config.monitor_interval()
        );
        let mut ticker = tokio::time::interval(self.config.monitor_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => self.monitor_tick().await,
                _ = shutdown.changed() => {
                    debug!("balancer monitor received shutdown");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn balancer(initial: usize, capacity: usize) -> LoadBalancer {
        LoadBalancer::new(BalancerConfig {
            pools: vec![PoolConfig {
                initial_workers: initial,
                max_concurrent_per_worker: capacity,
                ..Default::default()
            }],
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let balancer = balancer(1, 1);
        assert_matches!(
            balancer.assign("missing", "t1").await,
            Err(ScalingError::UnknownPool(name)) if name == "missing"
        );
    }

    #[tokio::test]
    async fn test_concurrent_assignment_respects_capacity() {
        let balancer = Arc::new(balancer(2, 3));
        let mut handles = vec![];
        for i in 0..20 {
            let balancer = Arc::clone(&balancer);
            handles.push(tokio::spawn(async move {
                balancer.assign("default", &format!("t{i}")).await.unwrap()
            }));
        }

        let mut assigned = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                assigned += 1;
            }
        }
        assert_eq!(assigned, 6);
        let stats = balancer.pool_stats("default").await.unwrap();
        assert_eq!(stats.active_tasks, 6);
        assert_eq!(stats.available, 0);
    }

    #[tokio::test]
    async fn test_degradation_with_hysteresis() {
        let balancer = balancer(2, 4);

        assert_eq!(balancer.check_degradation(0.96).await, Some(true));
        assert!(balancer.is_degraded());
        assert_eq!(balancer.pool_stats("default").await.unwrap().capacity, 4);

        // between 0.76 and 0.95: stays degraded
        assert_eq!(balancer.check_degradation(0.8).await, None);
        assert!(balancer.is_degraded());

        assert_eq!(balancer.check_degradation(0.7).await, Some(false));
        assert_eq!(balancer.pool_stats("default").await.unwrap().capacity, 8);
    }

    #[tokio::test]
    async fn test_suspended_auto_scaling_is_noop() {
        let balancer = balancer(1, 1);
        balancer.assign("default", "t1").await.unwrap();
        balancer.set_auto_scaling(false);
        assert!(balancer.auto_scale_tick().await.is_empty());

        balancer.set_auto_scaling(true);
        assert_eq!(balancer.auto_scale_tick().await.len(), 1);
        assert_eq!(balancer.total_workers().await, 2);
    }

    #[tokio::test]
    async fn test_set_strategy_returns_previous() {
        let balancer = balancer(1, 1);
        let previous = balancer
            .set_strategy("default", SelectionStrategy::ResourceBased)
            .await
            .unwrap();
        assert_eq!(previous, SelectionStrategy::LeastConnections);
        assert_eq!(
            balancer.strategies().await["default"],
            SelectionStrategy::ResourceBased
        );
    }

    #[tokio::test]
    async fn test_system_load_and_release() {
        let balancer = balancer(2, 2);
        let worker = balancer.assign("default", "t1").await.unwrap().unwrap();
        assert!((balancer.system_load().await - 0.25).abs() < 1e-9);

        assert!(balancer.release("default", &worker, "t1", false).await.unwrap());
        assert_eq!(balancer.system_load().await, 0.0);
        assert_eq!(balancer.pool_stats("default").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_report_worker_stats_marks_overload() {
        let balancer = balancer(1, 4);
        let stats = balancer.pool_stats("default").await.unwrap();
        assert_eq!(stats.available, 1);

        let worker_id = "default-worker-1";
        assert!(
            balancer
                .report_worker_stats("default", worker_id, 95.0, 100.0)
                .await
                .unwrap()
        );
        assert_eq!(balancer.pool_stats("default").await.unwrap().available, 0);
        assert!(balancer.assign("default", "t1").await.unwrap().is_none());
    }
}
