//! Memory accounting, evictable scratch cache and pressure-driven cleanup

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{MemoryConfig, Thresholds};
use crate::error::ScalingResult;

use super::source::{SharedMetricsSource, read_shared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub process: u64,
    pub usage_percentage: f64,
    pub pressure: MemoryPressure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryCleanupResult {
    /// `false` when the call fell inside the cooldown
    pub performed: bool,
    pub memory_before: u64,
    pub memory_after: u64,
    pub memory_freed: u64,
    pub cache_entries_cleared: usize,
    pub temp_paths_removed: usize,
    pub hooks_run: usize,
    pub timestamp: DateTime<Utc>,
}

impl MemoryCleanupResult {
    fn skipped() -> Self {
        Self {
            performed: false,
            memory_before: 0,
            memory_after: 0,
            memory_freed: 0,
            cache_entries_cleared: 0,
            temp_paths_removed: 0,
            hooks_run: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Releases memory held elsewhere in the process (buffers, pools, ...)
pub type ReclaimHook = Box<dyn Fn() + Send + Sync>;

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
}

#[derive(Default)]
struct CleanupState {
    last_cleanup: Option<Instant>,
    history: VecDeque<MemoryCleanupResult>,
}

pub struct MemoryManager {
    source: SharedMetricsSource,
    thresholds: Thresholds,
    config: MemoryConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
    temp_paths: Mutex<Vec<PathBuf>>,
    reclaim_hooks: Mutex<Vec<(String, ReclaimHook)>>,
    cleanup: Mutex<CleanupState>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("thresholds", &self.thresholds)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    pub fn new(source: SharedMetricsSource, thresholds: Thresholds, config: MemoryConfig) -> Self {
        Self {
            source,
            thresholds,
            config,
            cache: RwLock::new(HashMap::new()),
            temp_paths: Mutex::new(Vec::new()),
            reclaim_hooks: Mutex::new(Vec::new()),
            cleanup: Mutex::new(CleanupState::default()),
        }
    }

    pub fn check_memory_usage(&self) -> ScalingResult<MemoryStats> {
        let readings = read_shared(&self.source)?;
        let usage_percentage = readings.memory_percent();

        let pressure = if usage_percentage >= self.thresholds.critical {
            MemoryPressure::Critical
        } else if usage_percentage >= self.thresholds.warning {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Normal
        };

        Ok(MemoryStats {
            total: readings.memory_total,
            available: readings.memory_available,
            used: readings.memory_total.saturating_sub(readings.memory_available),
            process: readings.process_memory,
            usage_percentage,
            pressure,
        })
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cleanup_cooldown_secs)
    }

    /// Release everything this manager is allowed to drop
    ///
    /// Within the cooldown of the previous cleanup this is a no-op returning
    /// `performed: false`.
    #[instrument(skip(self))]
    pub async fn cleanup_if_needed(&self) -> MemoryCleanupResult {
        // held for the whole pass so concurrent callers serialize on it
        let mut state = self.cleanup.lock().await;

        if let Some(last) = state.last_cleanup {
            if last.elapsed() < self.cooldown() {
                debug!("memory cleanup skipped, last run {:?} ago", last.elapsed());
                return MemoryCleanupResult::skipped();
            }
        }

        let memory_before = self.used_memory();

        let cache_entries_cleared = self.clear_cache().await;
        let temp_paths_removed = self.remove_temp_paths().await;

        let hooks = self.reclaim_hooks.lock().await;
        for (name, hook) in hooks.iter() {
            debug!("running reclaim hook {name}");
            hook();
        }
        let hooks_run = hooks.len();
        drop(hooks);

        let memory_after = self.used_memory();
        let result = MemoryCleanupResult {
            performed: true,
            memory_before,
            memory_after,
            memory_freed: memory_before.saturating_sub(memory_after),
            cache_entries_cleared,
            temp_paths_removed,
            hooks_run,
            timestamp: Utc::now(),
        };

        info!(
            "memory cleanup freed {} ({cache_entries_cleared} cache entries, {temp_paths_removed} temp paths)",
            crate::util::format_bytes(result.memory_freed)
        );

        state.last_cleanup = Some(Instant::now());
        state.history.push_back(result.clone());
        while state.history.len() > self.config.cleanup_history_size {
            state.history.pop_front();
        }

        result
    }

    fn used_memory(&self) -> u64 {
        match self.check_memory_usage() {
            Ok(stats) => stats.used,
            Err(e) => {
                warn!("could not read memory usage: {e}");
                0
            }
        }
    }

    async fn remove_temp_paths(&self) -> usize {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.temp_paths.lock().await);
        let mut removed = 0;
        for path in paths {
            let result = if path.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove temp path {}: {e}", path.display()),
            }
        }
        removed
    }

    pub async fn cleanup_history(&self) -> Vec<MemoryCleanupResult> {
        self.cleanup.lock().await.history.iter().cloned().collect()
    }

    /// Register a temporary file or directory removed on the next cleanup
    pub async fn register_temp_path(&self, path: impl Into<PathBuf>) {
        self.temp_paths.lock().await.push(path.into());
    }

    /// Register a hook run on every effective cleanup
    pub async fn register_reclaim_hook(&self, name: impl Into<String>, hook: ReclaimHook) {
        self.reclaim_hooks.lock().await.push((name.into(), hook));
    }

    /// Store a value in the scratch cache; it may be evicted at any time
    pub async fn add_to_cache(&self, key: impl Into<String>, value: Value) {
        let mut cache = self.cache.write().await;
        let key = key.into();

        if !cache.contains_key(&key) && cache.len() >= self.config.max_cache_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }

        if self.config.max_cache_entries > 0 {
            cache.insert(
                key,
                CacheEntry {
                    value,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub async fn get_from_cache(&self, key: &str) -> Option<Value> {
        self.cache
            .read()
            .await
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub async fn remove_from_cache(&self, key: &str) -> Option<Value> {
        self.cache.write().await.remove(key).map(|entry| entry.value)
    }

    /// Drop every cached value, returning how many were held
    pub async fn clear_cache(&self) -> usize {
        let mut cache = self.cache.write().await;
        let count = cache.len();
        cache.clear();
        count
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::source::{ScriptedMetricsSource, SystemReadings, shared};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(source: &ScriptedMetricsSource, config: MemoryConfig) -> MemoryManager {
        MemoryManager::new(
            shared(source.clone()),
            Thresholds::new(75.0, 90.0, 98.0),
            config,
        )
    }

    #[test]
    fn test_pressure_levels() {
        let source = ScriptedMetricsSource::new();
        let manager = manager(&source, MemoryConfig::default());

        source.set(SystemReadings::with_usage(10.0, 50.0));
        assert_eq!(
            manager.check_memory_usage().unwrap().pressure,
            MemoryPressure::Normal
        );

        source.set(SystemReadings::with_usage(10.0, 80.0));
        assert_eq!(
            manager.check_memory_usage().unwrap().pressure,
            MemoryPressure::Warning
        );

        source.set(SystemReadings::with_usage(10.0, 95.0));
        let stats = manager.check_memory_usage().unwrap();
        assert_eq!(stats.pressure, MemoryPressure::Critical);
        assert_eq!(stats.used + stats.available, stats.total);
    }

    #[tokio::test]
    async fn test_cache_roundtrip_and_eviction() {
        let source = ScriptedMetricsSource::steady(SystemReadings::with_usage(10.0, 10.0));
        let manager = manager(
            &source,
            MemoryConfig {
                max_cache_entries: 2,
                ..Default::default()
            },
        );

        manager.add_to_cache("a", json!(1)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        manager.add_to_cache("b", json!(2)).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        manager.add_to_cache("c", json!(3)).await;

        assert_eq!(manager.cache_len().await, 2);
        assert_eq!(manager.get_from_cache("a").await, None);
        assert_eq!(manager.get_from_cache("c").await, Some(json!(3)));
        assert_eq!(manager.remove_from_cache("b").await, Some(json!(2)));
        assert_eq!(manager.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_within_cooldown() {
        let source = ScriptedMetricsSource::steady(SystemReadings::with_usage(10.0, 85.0));
        let manager = manager(&source, MemoryConfig::default());

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&hook_calls);
        manager
            .register_reclaim_hook(
                "counter",
                Box::new(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        manager.add_to_cache("key", json!({"large": true})).await;

        let first = manager.cleanup_if_needed().await;
        assert!(first.performed);
        assert_eq!(first.cache_entries_cleared, 1);
        assert_eq!(first.hooks_run, 1);

        manager.add_to_cache("key", json!(1)).await;
        let second = manager.cleanup_if_needed().await;
        assert!(!second.performed);
        assert_eq!(second.memory_freed, 0);
        assert_eq!(manager.cache_len().await, 1);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.cleanup_history().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_again_after_cooldown() {
        let source = ScriptedMetricsSource::steady(SystemReadings::with_usage(10.0, 85.0));
        let manager = manager(&source, MemoryConfig::default());

        assert!(manager.cleanup_if_needed().await.performed);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(manager.cleanup_if_needed().await.performed);
    }

    #[tokio::test]
    async fn test_cleanup_freed_is_saturating() {
        let source = ScriptedMetricsSource::new();
        source.push(SystemReadings::with_usage(10.0, 50.0));
        source.push(SystemReadings::with_usage(10.0, 60.0));
        let manager = manager(&source, MemoryConfig::default());

        let result = manager.cleanup_if_needed().await;
        assert!(result.performed);
        assert!(result.memory_after > result.memory_before);
        assert_eq!(result.memory_freed, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_temp_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scratch.bin");
        std::fs::write(&file, b"scratch").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("inner"), b"x").unwrap();

        let source = ScriptedMetricsSource::steady(SystemReadings::with_usage(10.0, 10.0));
        let manager = manager(&source, MemoryConfig::default());
        manager.register_temp_path(&file).await;
        manager.register_temp_path(&nested).await;
        manager.register_temp_path(dir.path().join("missing")).await;

        let result = manager.cleanup_if_needed().await;
        assert_eq!(result.temp_paths_removed, 2);
        assert!(!file.exists());
        assert!(!nested.exists());
    }
}
