//! Top-level control loop of one instance
//!
//! ## Operating Modes
//!
//! ```text
//!            cpu/memory read every check interval
//!   ┌────────┐    ┌──────────┐    ┌──────────┐    ┌───────────┐
//!   │ Normal │◄──►│ HighLoad │◄──►│ Degraded │◄──►│ Emergency │
//!   └────────┘    └──────────┘    └──────────┘    └───────────┘
//!        ▲                                              │
//!        └──────────── any mode to any mode ────────────┘
//! ```
//!
//! The manager is the only component that resizes pools while the instance
//! is Degraded or in Emergency; the balancer's own auto-scaling is suspended
//! in those modes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::actors::messages::ScalingEvent;
use crate::balancer::{LoadBalancer, PoolStats, ScalingAction, SelectionStrategy};
use crate::config::ScalingConfig;
use crate::monitors::memory::{MemoryManager, MemoryStats};
use crate::monitors::resources::{ResourceMonitor, ResourceType, SystemLoad};
use crate::processing::{ConcurrentProcessor, ProcessingStats, ShutdownReport};
use crate::stats::linear_regression;
use crate::supervisor::{DEFAULT_BACKOFF, spawn_supervised};

use super::mode::ScalabilityMode;
use super::predictor::{LoadPrediction, LoadPredictor};

/// Per-sample slope (percentage points) treated as a rising trend
const RISING_TREND: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    ScaleUp,
    ScaleDown,
    Hold,
    ModeChange,
    Predictive,
    Manual,
}

/// One entry of the decision history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub kind: DecisionKind,
    pub mode: ScalabilityMode,
    pub from_workers: usize,
    pub to_workers: usize,
    pub cpu: f64,
    pub memory: f64,
    pub cpu_trend: f64,
    pub memory_trend: f64,
    /// `false` when the decision was blocked (cooldown, bounds, mode)
    pub applied: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub instance_name: String,
    pub mode: ScalabilityMode,
    pub mode_since: DateTime<Utc>,
    pub total_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub balancer_auto_scaling: bool,
    pub balancer_degraded: bool,
    pub load: SystemLoad,
    pub memory: Option<MemoryStats>,
    pub active_alerts: usize,
    pub processing: ProcessingStats,
    pub pools: Vec<PoolStats>,
    pub last_prediction: Option<LoadPrediction>,
    pub recent_decisions: Vec<ScalingDecision>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Trend {
    cpu: f64,
    memory: f64,
}

#[derive(Debug)]
struct ManagerState {
    mode: ScalabilityMode,
    mode_since: DateTime<Utc>,
    /// Strategies in force before HighLoad switched every pool
    saved_strategies: Option<HashMap<String, SelectionStrategy>>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    decisions: VecDeque<ScalingDecision>,
    predictor: LoadPredictor,
    last_prediction: Option<LoadPrediction>,
}

pub struct ScalabilityManager {
    instance_name: String,
    config: ScalingConfig,
    monitor: Arc<ResourceMonitor>,
    memory: Arc<MemoryManager>,
    processor: ConcurrentProcessor,
    balancer: Arc<LoadBalancer>,
    state: Mutex<ManagerState>,
    event_tx: broadcast::Sender<ScalingEvent>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ScalabilityManager {
    pub fn new(
        instance_name: impl Into<String>,
        config: ScalingConfig,
        monitor: Arc<ResourceMonitor>,
        memory: Arc<MemoryManager>,
        processor: ConcurrentProcessor,
        balancer: Arc<LoadBalancer>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        let predictor = LoadPredictor::new(config.predictive.clone());

        Self {
            instance_name: instance_name.into(),
            state: Mutex::new(ManagerState {
                mode: ScalabilityMode::Normal,
                mode_since: Utc::now(),
                saved_strategies: None,
                last_scale_up: None,
                last_scale_down: None,
                decisions: VecDeque::new(),
                predictor,
                last_prediction: None,
            }),
            config,
            monitor,
            memory,
            processor,
            balancer,
            event_tx,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    pub fn processor(&self) -> &ConcurrentProcessor {
        &self.processor
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScalingEvent> {
        self.event_tx.subscribe()
    }

    pub async fn mode(&self) -> ScalabilityMode {
        self.state.lock().await.mode
    }

    pub async fn decision_history(&self) -> Vec<ScalingDecision> {
        self.state.lock().await.decisions.iter().cloned().collect()
    }

    /// Read the latest load and move to the mode it implies
    ///
    /// Also feeds the predictor. Returns the new mode when it changed.
    #[instrument(skip(self))]
    pub async fn check_mode(&self) -> Option<ScalabilityMode> {
        let load = self.monitor.current_load().await;
        let Some(at) = load.timestamp else {
            debug!("no resource samples yet, mode unchanged");
            return None;
        };

        let mut state = self.state.lock().await;
        if self.config.predictive.enabled {
            state.predictor.record(at, load.cpu, load.memory);
        }

        let next = ScalabilityMode::classify(load.cpu, load.memory, &self.config);
        if next == state.mode {
            return None;
        }
        self.transition(&mut state, next, &load).await;
        Some(next)
    }

    /// Apply the side effects of entering `to`
    async fn transition(&self, state: &mut ManagerState, to: ScalabilityMode, load: &SystemLoad) {
        let from = state.mode;
        let before = self.balancer.total_workers().await;
        info!(
            "mode {from} -> {to} (cpu {:.1}%, memory {:.1}%)",
            load.cpu, load.memory
        );

        state.mode = to;
        state.mode_since = Utc::now();
        self.balancer.set_auto_scaling(!to.suspends_auto_scaling());

        match to {
            ScalabilityMode::Emergency => {
                self.balancer
                    .scale_all_with("emergency mode", |_, min, _| min)
                    .await;
                self.balancer.set_degraded(true).await;
                let cleanup = self.memory.cleanup_if_needed().await;
                debug!("emergency cleanup performed: {}", cleanup.performed);
            }
            ScalabilityMode::Degraded => {
                self.balancer
                    .scale_all_with("degraded mode", |count, min, _| (count / 2).max(min))
                    .await;
                let cleanup = self.memory.cleanup_if_needed().await;
                debug!("degraded cleanup performed: {}", cleanup.performed);
            }
            ScalabilityMode::HighLoad => {
                if state.saved_strategies.is_none() {
                    state.saved_strategies = Some(self.balancer.strategies().await);
                }
                for pool in self.balancer.pool_names().await {
                    if let Err(e) = self
                        .balancer
                        .set_strategy(&pool, SelectionStrategy::ResourceBased)
                        .await
                    {
                        warn!("cannot switch strategy of {pool}: {e}");
                    }
                }
            }
            ScalabilityMode::Normal => {
                self.balancer.set_degraded(false).await;
                if let Some(saved) = state.saved_strategies.take() {
                    for (pool, strategy) in saved {
                        if let Err(e) = self.balancer.set_strategy(&pool, strategy).await {
                            warn!("cannot restore strategy of {pool}: {e}");
                        }
                    }
                }
            }
        }

        let after = self.balancer.total_workers().await;
        self.record_decision(
            state,
            ScalingDecision {
                kind: DecisionKind::ModeChange,
                mode: to,
                from_workers: before,
                to_workers: after,
                cpu: load.cpu,
                memory: load.memory,
                cpu_trend: 0.0,
                memory_trend: 0.0,
                applied: true,
                reason: format!("mode {from} -> {to}"),
                timestamp: Utc::now(),
            },
        );

        self.publish(ScalingEvent::ModeChanged {
            from,
            to,
            at: Utc::now(),
        });
        if before != after {
            self.publish(ScalingEvent::WorkersScaled {
                from: before,
                to: after,
                reason: format!("entered {to} mode"),
                at: Utc::now(),
            });
        }
    }

    async fn trend(&self) -> Trend {
        let window = self.config.trend_window.max(2);
        let slope = |samples: Vec<f64>| {
            let points: Vec<(f64, f64)> = samples
                .into_iter()
                .enumerate()
                .map(|(i, usage)| (i as f64, usage))
                .collect();
            linear_regression(&points).map_or(0.0, |fit| fit.slope)
        };

        let cpu = self.monitor.last_samples(ResourceType::Cpu, window).await;
        let memory = self.monitor.last_samples(ResourceType::Memory, window).await;
        Trend {
            cpu: slope(cpu.iter().map(|s| s.current_usage).collect()),
            memory: slope(memory.iter().map(|s| s.current_usage).collect()),
        }
    }

    /// Pool target clamped to both the pool's and the manager's bounds
    fn bounded(&self, target: usize, pool_min: usize, pool_max: usize) -> usize {
        let low = pool_min.max(self.config.min_workers);
        let high = pool_max.min(self.config.max_workers).max(low);
        target.clamp(low, high)
    }

    /// One pass of the scaling decision loop
    #[instrument(skip(self))]
    pub async fn evaluate_scaling(&self) -> ScalingDecision {
        let load = self.monitor.current_load().await;
        let trend = self.trend().await;
        let before = self.balancer.total_workers().await;
        let mut state = self.state.lock().await;

        let mut decision = ScalingDecision {
            kind: DecisionKind::Hold,
            mode: state.mode,
            from_workers: before,
            to_workers: before,
            cpu: load.cpu,
            memory: load.memory,
            cpu_trend: trend.cpu,
            memory_trend: trend.memory,
            applied: false,
            reason: String::new(),
            timestamp: Utc::now(),
        };

        if load.timestamp.is_none() {
            decision.reason = "no resource samples".to_string();
            return decision;
        }
        if state.mode.suspends_auto_scaling() {
            decision.reason = format!("held by {} mode", state.mode);
            self.record_decision(&mut state, decision.clone());
            return decision;
        }

        // extrapolate the trend across one window
        let horizon = self.config.trend_window as f64;
        let rising = (trend.cpu > RISING_TREND || trend.memory > RISING_TREND)
            && self.config.scale_up.reached_by(
                load.cpu + trend.cpu * horizon,
                load.memory + trend.memory * horizon,
            );
        let scale_up = self.config.scale_up.reached_by(load.cpu, load.memory) || rising;
        let scale_down = !scale_up
            && load.cpu < self.config.scale_down.cpu
            && load.memory < self.config.scale_down.memory
            && trend.cpu <= 0.0
            && trend.memory <= 0.0;

        let factor = self.config.worker_scale_factor;
        let now = Instant::now();
        if scale_up {
            decision.kind = DecisionKind::ScaleUp;
            if !cooldown_elapsed(state.last_scale_up, self.config.scale_up_cooldown(), now) {
                decision.reason = "scale up within cooldown".to_string();
            } else {
                let reason = format!(
                    "cpu {:.1}% (trend {:+.2}), memory {:.1}% (trend {:+.2})",
                    load.cpu, trend.cpu, load.memory, trend.memory
                );
                let actions = self
                    .balancer
                    .scale_all_with(&reason, |count, min, max| {
                        self.bounded((count as f64 * factor).ceil() as usize, min, max)
                    })
                    .await;
                if !actions.is_empty() {
                    state.last_scale_up = Some(now);
                }
                decision.applied = !actions.is_empty();
                decision.reason = reason;
            }
        } else if scale_down {
            decision.kind = DecisionKind::ScaleDown;
            if !cooldown_elapsed(state.last_scale_down, self.config.scale_down_cooldown(), now) {
                decision.reason = "scale down within cooldown".to_string();
            } else {
                let reason = format!(
                    "cpu {:.1}% and memory {:.1}% below scale down thresholds",
                    load.cpu, load.memory
                );
                let actions = self
                    .balancer
                    .scale_all_with(&reason, |count, min, max| {
                        self.bounded((count as f64 / factor).floor() as usize, min, max)
                    })
                    .await;
                if !actions.is_empty() {
                    state.last_scale_down = Some(now);
                }
                decision.applied = !actions.is_empty();
                decision.reason = reason;
            }
        } else {
            decision.reason = "load within band".to_string();
        }

        decision.to_workers = self.balancer.total_workers().await;
        if decision.applied {
            self.publish(ScalingEvent::WorkersScaled {
                from: before,
                to: decision.to_workers,
                reason: decision.reason.clone(),
                at: Utc::now(),
            });
        }
        if decision.kind != DecisionKind::Hold {
            self.record_decision(&mut state, decision.clone());
        }
        decision
    }

    /// Fit the load window and scale ahead of demand when confident
    #[instrument(skip(self))]
    pub async fn run_prediction(&self) -> Option<LoadPrediction> {
        if !self.config.predictive.enabled {
            return None;
        }

        let before = self.balancer.total_workers().await;
        let mut state = self.state.lock().await;
        let prediction = state.predictor.predict(before)?;
        state.last_prediction = Some(prediction.clone());

        if !state.predictor.is_confident(&prediction) {
            info!(
                "low confidence prediction ignored: cpu {:.1}%, memory {:.1}% in {}m (r² {:.2})",
                prediction.predicted_cpu,
                prediction.predicted_memory,
                prediction.horizon_minutes,
                prediction.confidence
            );
            return Some(prediction);
        }
        if state.mode.suspends_auto_scaling() {
            debug!("prediction not applied in {} mode", state.mode);
            return Some(prediction);
        }

        let recommended = self.bounded(
            prediction.recommended_workers,
            self.config.min_workers,
            self.config.max_workers,
        );
        let now = Instant::now();
        let (allowed, up) = match recommended.cmp(&before) {
            std::cmp::Ordering::Equal => return Some(prediction),
            std::cmp::Ordering::Greater => (
                cooldown_elapsed(state.last_scale_up, self.config.scale_up_cooldown(), now),
                true,
            ),
            std::cmp::Ordering::Less => (
                cooldown_elapsed(state.last_scale_down, self.config.scale_down_cooldown(), now),
                false,
            ),
        };

        let reason = format!(
            "predicted cpu {:.1}%, memory {:.1}% in {}m (r² {:.2})",
            prediction.predicted_cpu,
            prediction.predicted_memory,
            prediction.horizon_minutes,
            prediction.confidence
        );
        let mut applied = false;
        if allowed {
            let ratio = prediction.scale_ratio;
            let actions = self
                .balancer
                .scale_all_with(&reason, |count, min, max| {
                    self.bounded((count as f64 * ratio).ceil() as usize, min, max)
                })
                .await;
            applied = !actions.is_empty();
            if applied {
                if up {
                    state.last_scale_up = Some(now);
                } else {
                    state.last_scale_down = Some(now);
                }
            }
        } else {
            debug!("predictive scaling within cooldown");
        }

        let after = self.balancer.total_workers().await;
        let mode = state.mode;
        self.record_decision(
            &mut state,
            ScalingDecision {
                kind: DecisionKind::Predictive,
                mode,
                from_workers: before,
                to_workers: after,
                cpu: prediction.predicted_cpu,
                memory: prediction.predicted_memory,
                cpu_trend: 0.0,
                memory_trend: 0.0,
                applied,
                reason: reason.clone(),
                timestamp: Utc::now(),
            },
        );
        if applied {
            self.publish(ScalingEvent::WorkersScaled {
                from: before,
                to: after,
                reason,
                at: Utc::now(),
            });
        }

        Some(prediction)
    }

    /// Resize every pool to `target` workers
    ///
    /// Returns `false` when `target` lies outside the configured worker
    /// bounds. Pools clamp the target to their own bounds.
    #[instrument(skip(self))]
    pub async fn manual_scale(&self, target: usize, reason: &str) -> bool {
        if target < self.config.min_workers || target > self.config.max_workers {
            warn!(
                "manual scale to {target} rejected, bounds are {}..={}",
                self.config.min_workers, self.config.max_workers
            );
            return false;
        }

        let before = self.balancer.total_workers().await;
        let reason = format!("manual: {reason}");
        let actions: Vec<ScalingAction> = self
            .balancer
            .scale_all_with(&reason, |_, _, _| target)
            .await;
        let after = self.balancer.total_workers().await;

        let load = self.monitor.current_load().await;
        let mut state = self.state.lock().await;
        let mode = state.mode;
        self.record_decision(
            &mut state,
            ScalingDecision {
                kind: DecisionKind::Manual,
                mode,
                from_workers: before,
                to_workers: after,
                cpu: load.cpu,
                memory: load.memory,
                cpu_trend: 0.0,
                memory_trend: 0.0,
                applied: !actions.is_empty(),
                reason: reason.clone(),
                timestamp: Utc::now(),
            },
        );
        if before != after {
            self.publish(ScalingEvent::WorkersScaled {
                from: before,
                to: after,
                reason,
                at: Utc::now(),
            });
        }
        true
    }

    pub async fn get_status(&self) -> ManagerStatus {
        let load = self.monitor.current_load().await;
        let memory = self.memory.check_memory_usage().ok();
        let active_alerts = self.monitor.active_alerts().await.len();
        let processing = self.processor.get_stats().await;
        let pools = self.balancer.all_stats().await;
        let total_workers = pools.iter().map(|pool| pool.workers).sum();

        let state = self.state.lock().await;
        ManagerStatus {
            instance_name: self.instance_name.clone(),
            mode: state.mode,
            mode_since: state.mode_since,
            total_workers,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            balancer_auto_scaling: self.balancer.auto_scaling_enabled(),
            balancer_degraded: self.balancer.is_degraded(),
            load,
            memory,
            active_alerts,
            processing,
            pools,
            last_prediction: state.last_prediction.clone(),
            recent_decisions: state.decisions.iter().rev().take(10).cloned().collect(),
        }
    }

    fn record_decision(&self, state: &mut ManagerState, decision: ScalingDecision) {
        state.decisions.push_back(decision);
        while state.decisions.len() > self.config.decision_history_size.max(1) {
            state.decisions.pop_front();
        }
    }

    fn publish(&self, event: ScalingEvent) {
        // nobody listening is fine
        let _ = self.event_tx.send(event);
    }

    /// Start every periodic loop of the instance
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }
        info!("starting scalability manager for {}", self.instance_name);

        self.processor.start().await;

        let monitor = Arc::clone(&self.monitor);
        let shutdown = self.shutdown_tx.subscribe();
        loops.push(spawn_supervised(
            "resource monitor",
            self.shutdown_tx.subscribe(),
            DEFAULT_BACKOFF,
            move || {
                let monitor = Arc::clone(&monitor);
                let shutdown = shutdown.clone();
                async move { monitor.run(shutdown).await }
            },
        ));

        let balancer = Arc::clone(&self.balancer);
        let shutdown = self.shutdown_tx.subscribe();
        loops.push(spawn_supervised(
            "balancer monitor",
            self.shutdown_tx.subscribe(),
            DEFAULT_BACKOFF,
            move || {
                let balancer = Arc::clone(&balancer);
                let shutdown = shutdown.clone();
                async move { balancer.run(shutdown).await }
            },
        ));

        let manager = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        loops.push(spawn_supervised(
            "mode check",
            self.shutdown_tx.subscribe(),
            DEFAULT_BACKOFF,
            move || {
                let manager = Arc::clone(&manager);
                let shutdown = shutdown.clone();
                async move { manager.run_mode_checks(shutdown).await }
            },
        ));

        let manager = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        loops.push(spawn_supervised(
            "scaling decision",
            self.shutdown_tx.subscribe(),
            DEFAULT_BACKOFF,
            move || {
                let manager = Arc::clone(&manager);
                let shutdown = shutdown.clone();
                async move { manager.run_decisions(shutdown).await }
            },
        ));

        if self.config.predictive.enabled {
            let manager = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            loops.push(spawn_supervised(
                "predictive scaling",
                self.shutdown_tx.subscribe(),
                DEFAULT_BACKOFF,
                move || {
                    let manager = Arc::clone(&manager);
                    let shutdown = shutdown.clone();
                    async move { manager.run_predictions(shutdown).await }
                },
            ));
        }
    }

    async fn run_mode_checks(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_mode().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_decisions(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.decision_interval());
        // the first tick completes immediately, give the monitor time to sample
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let decision = self.evaluate_scaling().await;
                    debug!("scaling decision {:?}: {}", decision.kind, decision.reason);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_predictions(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.predictive.interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_prediction().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Drain the processor and stop every loop
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        info!("shutting down scalability manager");
        let report = self.processor.shutdown(timeout).await;

        let _ = self.shutdown_tx.send(true);
        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            let _ = handle.await;
        }
        report
    }
}

fn cooldown_elapsed(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.is_none_or(|last| now.duration_since(last) >= cooldown)
}
